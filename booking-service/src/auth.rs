//! Role gating. Credentials are checked upstream; the authenticated role
//! arrives in the `x-user-role` header.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub const ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Technician,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ViewCatalog,
    Quote,
    AnalyzeMedia,
    DriveBooking,
    PublishChannel,
    ManageChannel,
}

impl Role {
    pub fn allows(&self, capability: Capability) -> bool {
        use Capability::*;
        match self {
            Role::Customer => matches!(capability, ViewCatalog | Quote | AnalyzeMedia | DriveBooking),
            Role::Technician => !matches!(capability, ManageChannel),
            Role::Admin => true,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "technician" => Ok(Role::Technician),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Customer => "customer",
            Role::Technician => "technician",
            Role::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Resolves the caller's role and stores it as a request extension.
/// A missing header means an anonymous customer.
pub async fn role_middleware(mut request: Request<Body>, next: Next) -> Response {
    let header = request
        .headers()
        .get(ROLE_HEADER)
        .map(|v| v.to_str().map(str::to_string));

    let role = match header {
        None => Role::Customer,
        Some(Ok(value)) => match value.parse::<Role>() {
            Ok(role) => role,
            Err(e) => {
                warn!(error = %e, "rejecting request with unknown role");
                return (StatusCode::UNAUTHORIZED, Json(json!({ "error": e }))).into_response();
            }
        },
        Some(Err(_)) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "role header is not valid text" })),
            )
                .into_response();
        }
    };

    request.extensions_mut().insert(role);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_matrix() {
        assert!(Role::Customer.allows(Capability::DriveBooking));
        assert!(!Role::Customer.allows(Capability::PublishChannel));
        assert!(Role::Technician.allows(Capability::PublishChannel));
        assert!(!Role::Technician.allows(Capability::ManageChannel));
        assert!(Role::Admin.allows(Capability::ManageChannel));
    }

    #[test]
    fn parses_header_values() {
        assert_eq!(" Admin ".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
    }
}
