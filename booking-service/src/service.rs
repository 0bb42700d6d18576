use axum::{
    Extension, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::{Json, Response},
    routing::{get, post, put},
};
use repair_flow::{
    BookingRunner, Channel, ChannelHub, Device, DeviceCatalog, Envelope, FlowConfig, FlowError,
    FlowServices, InMemorySessionStorage, LocalEstimator, PricingRules, ProblemClassifier,
    RepairCategory, SessionId, SessionStorage, Topic, UploadOrchestrator, WizardCommand,
    WizardStep, flow::BookingView,
    http::{PhotoAnalysisResponse, QuoteRequest, QuoteResponse},
    nlu::MessageAnalysis,
    upload::PhotoFile,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    analysis::PhotoAnalysisEngine,
    auth::{Capability, Role, role_middleware},
    models::{
        AnalyzeTextRequest, ChannelStateRequest, ChannelStatusResponse, CommandResponse,
        DeviceCatalogResponse, DeviceFilter, DeviceListing, PhotoUploadResponse,
    },
    responder::{spawn_photo_responder, spawn_pricing_responder},
    sse::session_events,
};

type ApiResult<T> = Result<Json<T>, ApiError>;
pub type ApiError = (StatusCode, Json<Value>);

pub fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "id": id
        })),
    )
}

fn conflict_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn forbidden_error(role: Role, capability: Capability) -> ApiError {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "Not allowed for this role",
            "role": role,
            "capability": capability
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

/// Maps flow errors onto status codes; `context` becomes the `error` field.
fn flow_error(context: &str, e: FlowError) -> ApiError {
    match &e {
        FlowError::Validation(reason) | FlowError::UploadRejected(reason) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": context, "details": reason })),
        ),
        FlowError::StepIncomplete { .. }
        | FlowError::InvalidTransition(_)
        | FlowError::SlotLocked { .. } => conflict_error(context, &e.to_string()),
        FlowError::SessionNotFound(id)
        | FlowError::DeviceNotFound(id)
        | FlowError::UploadNotFound(id) => not_found_error(&e.to_string(), id),
        FlowError::ServerReported(reason) | FlowError::Transport(reason) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": context, "details": reason })),
        ),
        _ => {
            error!(error = %e, "{}", context);
            internal_error(context, &e.to_string())
        }
    }
}

fn require(role: Role, capability: Capability) -> Result<(), ApiError> {
    if role.allows(capability) {
        Ok(())
    } else {
        warn!(%role, ?capability, "capability denied");
        Err(forbidden_error(role, capability))
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| bad_request_error("Invalid session id format"))
}

#[derive(Clone)]
pub struct AppState {
    pub runner: BookingRunner,
    pub hub: Arc<ChannelHub>,
    pub catalog: Arc<DeviceCatalog>,
    pub estimator: LocalEstimator,
    pub classifier: Arc<ProblemClassifier>,
    pub photos: PhotoAnalysisEngine,
    pub config: FlowConfig,
}

impl AppState {
    pub fn new(
        catalog: DeviceCatalog,
        rules: PricingRules,
        config: FlowConfig,
        storage: Arc<dyn SessionStorage>,
    ) -> anyhow::Result<Self> {
        let hub = Arc::new(ChannelHub::default());
        let catalog = Arc::new(catalog);
        let estimator = LocalEstimator::new(Arc::new(rules));
        let classifier = Arc::new(ProblemClassifier::new()?);

        let services = FlowServices {
            catalog: catalog.clone(),
            estimator: estimator.clone(),
            channel: hub.clone(),
            classifier: classifier.clone(),
            config: config.clone(),
        };

        Ok(Self {
            runner: BookingRunner::new(services, storage),
            hub,
            catalog,
            estimator,
            photos: PhotoAnalysisEngine::new(classifier.clone()),
            classifier,
            config,
        })
    }

    /// Starts the channel responders for this state's hub.
    pub fn spawn_responders(&self) {
        spawn_pricing_responder(self.hub.clone(), self.estimator.clone());
        spawn_photo_responder(self.hub.clone(), self.photos.clone());
    }
}

pub async fn create_app() -> anyhow::Result<Router> {
    let app_state = create_app_state()?;
    app_state.spawn_responders();
    Ok(build_router(app_state))
}

fn create_app_state() -> anyhow::Result<AppState> {
    let catalog = match std::env::var("DEVICE_CATALOG_PATH") {
        Ok(path) => {
            info!(%path, "loading device catalog");
            DeviceCatalog::load(&path)?
        }
        Err(_) => {
            info!("using built-in device catalog (set DEVICE_CATALOG_PATH to override)");
            DeviceCatalog::default()
        }
    };
    let rules = match std::env::var("PRICING_RULES_PATH") {
        Ok(path) => {
            info!(%path, "loading pricing rules");
            PricingRules::load(&path)?
        }
        Err(_) => PricingRules::default(),
    };
    let config = FlowConfig::from_env()?;

    AppState::new(catalog, rules, config, Arc::new(InMemorySessionStorage::new()))
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

pub fn build_router(app_state: AppState) -> Router {
    let upload_limit = app_state.config.upload.max_file_bytes as usize + 64 * 1024;
    let batch_limit = upload_limit * app_state.config.upload.max_queue.max(1);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/devices", get(list_devices))
        .route("/api/bookings", post(create_booking))
        .route("/api/bookings/{session_id}", get(get_booking))
        .route("/api/bookings/{session_id}/commands", post(run_command))
        .route("/api/bookings/{session_id}/events", get(session_events))
        .route(
            "/api/bookings/{session_id}/photos",
            post(upload_booking_photos).layer(DefaultBodyLimit::max(batch_limit)),
        )
        .route("/api/channel", get(channel_status))
        .route("/api/channel/state", put(set_channel_state))
        .route("/api/channel/publish", post(publish_envelope))
        .route("/api/pricing/calculate", post(calculate_price))
        .route("/api/photos/upload-and-analyze", post(upload_and_analyze))
        .route("/api/nlu/analyze", post(analyze_text))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(from_fn(role_middleware))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Device Repair Booking Service",
        "version": "1.0.0",
        "description": "Booking wizard with real-time pricing and photo analysis",
        "endpoints": {
            "GET /api/devices": "Device catalog with the repairs offered per device (?category=)",
            "POST /api/bookings": "Start a booking",
            "GET /api/bookings/{session_id}": "Booking state",
            "POST /api/bookings/{session_id}/commands": "Apply one wizard command",
            "GET /api/bookings/{session_id}/events": "Server-sent channel events for a booking",
            "POST /api/bookings/{session_id}/photos": "Upload and attach photos to a booking",
            "GET /api/channel": "Channel connection state",
            "PUT /api/channel/state": "Connect or disconnect the channel (admin)",
            "POST /api/channel/publish": "Publish an envelope (technician, admin)",
            "POST /api/pricing/calculate": "Price quote",
            "POST /api/photos/upload-and-analyze": "Multipart photo upload with analysis",
            "POST /api/nlu/analyze": "Classify a free-text problem description",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "channel": state.hub.connection_state(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_devices(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Query(filter): Query<DeviceFilter>,
) -> ApiResult<DeviceCatalogResponse> {
    require(role, Capability::ViewCatalog)?;

    let rules = state.estimator.rules();
    let listed: Vec<&Device> = match filter.category {
        Some(category) => state.catalog.by_category(category).collect(),
        None => state.catalog.devices().iter().collect(),
    };
    let devices = listed
        .into_iter()
        .map(|device| DeviceListing {
            device: device.clone(),
            repairs: RepairCategory::ALL
                .into_iter()
                .filter(|r| rules.offers(device.category, *r))
                .collect(),
        })
        .collect();

    Ok(Json(DeviceCatalogResponse {
        devices,
        brands: state.catalog.brands().into_iter().map(String::from).collect(),
    }))
}

async fn create_booking(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
) -> Result<(StatusCode, Json<BookingView>), ApiError> {
    require(role, Capability::DriveBooking)?;

    let view = state
        .runner
        .start()
        .await
        .map_err(|e| flow_error("Failed to create booking", e))?;
    info!(session_id = %view.session_id, "booking started");
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_booking(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Path(session_id): Path<String>,
) -> ApiResult<BookingView> {
    require(role, Capability::DriveBooking)?;
    let session_id = parse_session_id(&session_id)?;

    state
        .runner
        .view(&session_id)
        .await
        .map(Json)
        .map_err(|e| flow_error("Failed to load booking", e))
}

async fn run_command(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Path(session_id): Path<String>,
    Json(command): Json<WizardCommand>,
) -> ApiResult<CommandResponse> {
    require(role, Capability::DriveBooking)?;
    let session_id = parse_session_id(&session_id)?;

    let result = state
        .runner
        .run(&session_id, command)
        .await
        .map_err(|e| flow_error("Command refused", e))?;

    Ok(Json(CommandResponse {
        transition: result.transition,
        booking: result.view,
    }))
}

async fn channel_status(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
) -> ApiResult<ChannelStatusResponse> {
    require(role, Capability::ViewCatalog)?;
    Ok(Json(ChannelStatusResponse {
        state: state.hub.connection_state(),
        pricing_responders: state.hub.subscriber_count(Topic::PriceCalculationRequest),
    }))
}

async fn set_channel_state(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Json(request): Json<ChannelStateRequest>,
) -> ApiResult<ChannelStatusResponse> {
    require(role, Capability::ManageChannel)?;
    info!(state = ?request.state, "channel state set");
    state.hub.set_state(request.state);
    channel_status(State(state), Extension(role)).await
}

async fn publish_envelope(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Json(envelope): Json<Envelope>,
) -> ApiResult<Value> {
    require(role, Capability::PublishChannel)?;
    let topic = envelope.topic;

    state
        .hub
        .publish(envelope)
        .await
        .map_err(|e| flow_error("Publish failed", e))?;
    Ok(Json(json!({ "published": topic })))
}

async fn calculate_price(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Json(request): Json<QuoteRequest>,
) -> ApiResult<QuoteResponse> {
    require(role, Capability::Quote)?;

    let inputs = request
        .into_inputs(&state.catalog)
        .map_err(|e| flow_error("Invalid pricing request", e))?;
    let estimate = state
        .estimator
        .estimate(&inputs)
        .map_err(|e| flow_error("Pricing failed", e))?;

    info!(device = %inputs.device.id, total = %estimate.total, "quote calculated");
    Ok(Json(QuoteResponse::new(&inputs, &estimate)))
}

async fn upload_and_analyze(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    mut multipart: Multipart,
) -> ApiResult<PhotoAnalysisResponse> {
    require(role, Capability::AnalyzeMedia)?;

    let photo = read_photos(&mut multipart, 1)
        .await?
        .pop()
        .ok_or_else(|| bad_request_error("A 'photo' field is required"))?;

    if let Err(reason) = state.config.upload.check(&photo) {
        return Err(flow_error("Upload rejected", FlowError::UploadRejected(reason)));
    }

    let analysis = state
        .photos
        .analyze_bytes(&photo.name, &photo.data)
        .map_err(|e| bad_request_error(&e.to_string()))?;

    Ok(Json(PhotoAnalysisResponse {
        upload_id: Uuid::new_v4(),
        file_name: photo.name,
        analysis,
    }))
}

/// Collects up to `limit` multipart fields named `photo`.
async fn read_photos(multipart: &mut Multipart, limit: usize) -> Result<Vec<PhotoFile>, ApiError> {
    let mut photos = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request_error(&format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some("photo") {
            continue;
        }
        if photos.len() == limit {
            break;
        }
        let name = field.file_name().unwrap_or("photo").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request_error(&format!("Failed to read upload: {}", e)))?;
        photos.push(PhotoFile {
            name,
            content_type,
            data: data.to_vec(),
        });
    }
    Ok(photos)
}

async fn upload_booking_photos(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<PhotoUploadResponse> {
    require(role, Capability::DriveBooking)?;
    require(role, Capability::AnalyzeMedia)?;
    let session_id = parse_session_id(&session_id)?;

    let view = state
        .runner
        .view(&session_id)
        .await
        .map_err(|e| flow_error("Failed to load booking", e))?;
    if view.step != WizardStep::PhotoUpload {
        return Err(conflict_error(
            "Photos can only be attached on the photo step",
            &format!("current step is {}", view.step),
        ));
    }

    let policy = state.config.upload.clone();
    let files = read_photos(&mut multipart, policy.max_queue).await?;
    if files.is_empty() {
        return Err(bad_request_error("At least one 'photo' field is required"));
    }

    let mut orchestrator = UploadOrchestrator::new(session_id, state.hub.clone(), policy)
        .with_fallback(Arc::new(state.photos.clone()));
    orchestrator.mount();
    let rejected: Vec<String> = orchestrator
        .add_files(files)
        .into_iter()
        .filter_map(|added| added.err().map(|e| e.to_string()))
        .collect();
    let uploaded = orchestrator.upload_pending().await;
    if uploaded.is_ok() {
        orchestrator.run_until_settled().await;
    }
    orchestrator.unmount();
    uploaded.map_err(|e| flow_error("Photo upload failed", e))?;

    let mut booking = view;
    for record in orchestrator.queue().completed_records() {
        booking = state
            .runner
            .run(&session_id, WizardCommand::AttachPhoto { record })
            .await
            .map_err(|e| flow_error("Failed to attach photo", e))?
            .view;
    }

    info!(
        %session_id,
        attached = orchestrator.queue().completed_records().len(),
        rejected = rejected.len(),
        "booking photos processed"
    );
    Ok(Json(PhotoUploadResponse {
        uploads: orchestrator.queue().items().to_vec(),
        rejected,
        booking,
    }))
}

async fn analyze_text(
    State(state): State<AppState>,
    Extension(role): Extension<Role>,
    Json(request): Json<AnalyzeTextRequest>,
) -> ApiResult<MessageAnalysis> {
    require(role, Capability::AnalyzeMedia)?;
    if request.text.trim().is_empty() {
        return Err(bad_request_error("Text is required"));
    }
    Ok(Json(state.classifier.analyze_with_estimate(
        &request.text,
        &state.catalog,
        &state.estimator,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::png;
    use axum::body::to_bytes;
    use repair_flow::{HttpFallbackClient, PricingInputs, ServiceOptions, UrgencyTier};
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(
            DeviceCatalog::default(),
            PricingRules::default(),
            FlowConfig::default(),
            Arc::new(InMemorySessionStorage::new()),
        )
        .unwrap()
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_channel_state() {
        let app = build_router(state());
        let (status, body) = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channel"], "connected");
    }

    #[tokio::test]
    async fn quote_endpoint_prices_high_urgency_macbook() {
        let app = build_router(state());
        let (status, body) = call(
            &app,
            post_json(
                "/api/pricing/calculate",
                json!({
                    "deviceModelId": "macbook-pro-16-2021",
                    "repairType": "screen-repair",
                    "urgencyLevel": "HIGH"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pricing"]["finalPrice"], 600.0);
        assert_eq!(body["repairDetails"]["deviceName"], "Apple MacBook Pro 16 2021");
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let app = build_router(state());
        let (status, _) = call(
            &app,
            post_json(
                "/api/pricing/calculate",
                json!({
                    "deviceModelId": "nokia-3310",
                    "repairType": "screen-repair",
                    "urgencyLevel": "STANDARD"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn customers_cannot_publish_or_manage_channel() {
        let app = build_router(state());
        let envelope = Envelope::new(Topic::PriceUpdate, json!({})).unwrap();
        let (status, _) = call(
            &app,
            post_json("/api/channel/publish", serde_json::to_value(&envelope).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let request = Request::put("/api/channel/state")
            .header("content-type", "application/json")
            .header("x-user-role", "technician")
            .body(Body::from(json!({ "state": "disconnected" }).to_string()))
            .unwrap();
        let (status, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn devices_can_be_filtered_by_category() {
        let app = build_router(state());
        let (status, body) = call(
            &app,
            Request::get("/api/devices?category=laptop").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let devices = body["devices"].as_array().unwrap();
        assert!(!devices.is_empty());
        assert!(devices.iter().all(|d| d["category"] == "laptop"));

        let (_, all) = call(&app, Request::get("/api/devices").body(Body::empty()).unwrap()).await;
        assert!(all["devices"].as_array().unwrap().len() > devices.len());

        let (status, _) = call(
            &app,
            Request::get("/api/devices?category=toaster").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_role_is_unauthorized() {
        let app = build_router(state());
        let request = Request::get("/api/devices")
            .header("x-user-role", "superuser")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn booking_flow_over_http_uses_channel_pricing() {
        let state = state();
        state.spawn_responders();
        let app = build_router(state);

        let (status, created) = call(&app, post_json("/api/bookings", json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["sessionId"].as_str().unwrap().to_string();
        let commands = format!("/api/bookings/{}/commands", id);

        for command in [
            json!({ "type": "selectDevice", "deviceId": "macbook-pro-16-2021" }),
            json!({ "type": "next" }),
            json!({ "type": "toggleIssue", "issue": "screen-repair" }),
            json!({ "type": "next" }),
        ] {
            let (status, body) = call(&app, post_json(&commands, command)).await;
            assert_eq!(status, StatusCode::OK, "{}", body);
        }

        let (status, body) = call(&app, post_json(&commands, json!({ "type": "next" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transition"]["to"], "pricing-review");
        assert_eq!(body["booking"]["pricing"]["state"]["state"], "settled");
        assert_eq!(body["booking"]["pricing"]["source"], "remote");
        assert_eq!(body["booking"]["pricing"]["estimate"]["total"], 40_000);
    }

    #[tokio::test]
    async fn refused_transition_is_a_conflict() {
        let app = build_router(state());
        let (_, created) = call(&app, post_json("/api/bookings", json!({}))).await;
        let id = created["sessionId"].as_str().unwrap();

        let (status, body) = call(
            &app,
            post_json(&format!("/api/bookings/{}/commands", id), json!({ "type": "next" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["details"].as_str().unwrap().contains("select a device"));
    }

    #[tokio::test]
    async fn nlu_endpoint_classifies_text() {
        let app = build_router(state());
        let (status, body) = call(
            &app,
            post_json(
                "/api/nlu/analyze",
                json!({ "text": "How much to fix the cracked screen on my Galaxy S23?" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["problem"]["category"], "screen-repair");
        assert_eq!(body["intent"]["intent"], "price_inquiry");
        assert_eq!(body["device"]["device"]["id"], "galaxy-s23");
        assert_eq!(body["responseType"], "price_estimate");
        assert_eq!(body["repairEstimate"]["deviceId"], "galaxy-s23");
        assert_eq!(body["repairEstimate"]["currency"], "GBP");
        assert!(body["repairEstimate"]["estimatedCost"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn http_fallback_client_against_live_server() {
        let app = build_router(state());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpFallbackClient::new(format!("http://{}", addr)).unwrap();
        let inputs = PricingInputs {
            device: DeviceCatalog::default()
                .require("macbook-pro-16-2021")
                .unwrap()
                .clone(),
            issues: [RepairCategory::ScreenRepair].into_iter().collect(),
            options: ServiceOptions {
                urgency: UrgencyTier::High,
                ..Default::default()
            },
        };
        let estimate = client.quote(&inputs).await.unwrap();
        assert_eq!(estimate.total.minor(), 60_000);

        let analysis = client
            .upload_and_analyze(&PhotoFile {
                name: "cracked_screen.png".to_string(),
                content_type: "image/png".to_string(),
                data: png(1280, 960),
            })
            .await
            .unwrap();
        assert_eq!(analysis.analysis.detected_issues, vec![RepairCategory::ScreenRepair]);

        let rejected = client
            .upload_and_analyze(&PhotoFile {
                name: "notes.txt".to_string(),
                content_type: "text/plain".to_string(),
                data: b"hello".to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(rejected, FlowError::ServerReported(_)));
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn booking_at_photo_step(client: &reqwest::Client, base: &str) -> String {
        let created: Value = client
            .post(format!("{}/api/bookings", base))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["sessionId"].as_str().unwrap().to_string();
        for command in [
            json!({ "type": "selectDevice", "deviceId": "galaxy-s23" }),
            json!({ "type": "next" }),
            json!({ "type": "toggleIssue", "issue": "screen-repair" }),
            json!({ "type": "next" }),
        ] {
            let response = client
                .post(format!("{}/api/bookings/{}/commands", base, id))
                .json(&command)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::OK);
        }
        id
    }

    fn photo_batch() -> reqwest::multipart::Form {
        let cracked = reqwest::multipart::Part::bytes(png(1280, 960))
            .file_name("cracked_screen.png")
            .mime_str("image/png")
            .unwrap();
        let notes = reqwest::multipart::Part::bytes(b"hello".to_vec())
            .file_name("notes.txt")
            .mime_str("text/plain")
            .unwrap();
        reqwest::multipart::Form::new()
            .part("photo", cracked)
            .part("photo", notes)
    }

    #[tokio::test]
    async fn booking_photos_are_analyzed_over_the_channel_and_attached() {
        let state = state();
        state.spawn_responders();
        let base = serve(build_router(state)).await;
        let client = reqwest::Client::new();
        let id = booking_at_photo_step(&client, &base).await;

        let response = client
            .post(format!("{}/api/bookings/{}/photos", base, id))
            .multipart(photo_batch())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();

        assert_eq!(body["uploads"].as_array().unwrap().len(), 1);
        assert_eq!(body["uploads"][0]["status"], "completed");
        assert_eq!(body["rejected"].as_array().unwrap().len(), 1);
        assert!(body["rejected"][0].as_str().unwrap().contains("notes.txt"));
        let photos = body["booking"]["draft"]["photos"].as_array().unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(body["booking"]["step"], "photo-upload");
    }

    #[tokio::test]
    async fn booking_photos_fall_back_to_local_analysis_while_disconnected() {
        let state = state();
        state.hub.disconnect();
        let base = serve(build_router(state)).await;
        let client = reqwest::Client::new();
        let id = booking_at_photo_step(&client, &base).await;

        let body: Value = client
            .post(format!("{}/api/bookings/{}/photos", base, id))
            .multipart(photo_batch())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["uploads"][0]["status"], "completed");
        assert_eq!(body["booking"]["draft"]["photos"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn booking_photos_outside_the_photo_step_conflict() {
        let base = serve(build_router(state())).await;
        let client = reqwest::Client::new();
        let created: Value = client
            .post(format!("{}/api/bookings", base))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["sessionId"].as_str().unwrap();

        let response = client
            .post(format!("{}/api/bookings/{}/photos", base, id))
            .multipart(photo_batch())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    }
}
