use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    error::{FlowError, Result},
    model::{Device, DeviceCategory, Money},
};

/// Read-only device reference data, constructed once at bootstrap and shared
/// by `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
}

impl DeviceCatalog {
    pub fn new(devices: Vec<Device>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for device in &devices {
            if !seen.insert(device.id.as_str()) {
                return Err(FlowError::Config(format!(
                    "duplicate device id '{}' in catalog",
                    device.id
                )));
            }
            if device.average_repair_cost.minor() <= 0 {
                return Err(FlowError::Config(format!(
                    "device '{}' has a non-positive average repair cost",
                    device.id
                )));
            }
        }
        Ok(Self { devices })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let devices: Vec<Device> = serde_json::from_str(json)?;
        Self::new(devices)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn require(&self, id: &str) -> Result<&Device> {
        self.get(id)
            .ok_or_else(|| FlowError::DeviceNotFound(id.to_string()))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn brands(&self) -> Vec<&str> {
        let mut brands: Vec<&str> = self.devices.iter().map(|d| d.brand.as_str()).collect();
        brands.sort_unstable();
        brands.dedup();
        brands
    }

    pub fn by_category(&self, category: DeviceCategory) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(move |d| d.category == category)
    }
}

impl Default for DeviceCatalog {
    fn default() -> Self {
        let device = |id: &str, brand: &str, model: &str, year, category, pounds: i64| Device {
            id: id.to_string(),
            brand: brand.to_string(),
            model: model.to_string(),
            year,
            category,
            average_repair_cost: Money::from_minor(pounds * 100),
        };

        Self {
            devices: vec![
                device("macbook-pro-16-2021", "Apple", "MacBook Pro 16 2021", 2021, DeviceCategory::Laptop, 400),
                device("macbook-air-13-2020", "Apple", "MacBook Air 13 2020", 2020, DeviceCategory::Laptop, 300),
                device("iphone-15-pro", "Apple", "iPhone 15 Pro", 2023, DeviceCategory::Phone, 220),
                device("iphone-13", "Apple", "iPhone 13", 2021, DeviceCategory::Phone, 150),
                device("galaxy-s23", "Samsung", "Galaxy S23", 2023, DeviceCategory::Phone, 180),
                device("ipad-air-5", "Apple", "iPad Air 5", 2022, DeviceCategory::Tablet, 200),
                device("xps-15-2022", "Dell", "XPS 15 2022", 2022, DeviceCategory::Laptop, 320),
                device("imac-24-2021", "Apple", "iMac 24 2021", 2021, DeviceCategory::Desktop, 350),
                device("playstation-5", "Sony", "PlayStation 5", 2020, DeviceCategory::Console, 120),
                device("watch-series-8", "Apple", "Watch Series 8", 2022, DeviceCategory::Wearable, 100),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_has_reference_laptop() {
        let catalog = DeviceCatalog::default();
        let device = catalog.require("macbook-pro-16-2021").unwrap();
        assert_eq!(device.model, "MacBook Pro 16 2021");
        assert_eq!(device.average_repair_cost, Money::from_minor(40_000));
        assert!(catalog.brands().contains(&"Apple"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"[
            {"id":"a","brand":"B","model":"M","year":2020,"category":"phone","averageRepairCost":1000},
            {"id":"a","brand":"B","model":"N","year":2021,"category":"phone","averageRepairCost":1200}
        ]"#;
        assert!(matches!(
            DeviceCatalog::from_json(json),
            Err(FlowError::Config(_))
        ));
    }

    #[test]
    fn unknown_device_is_reported() {
        let catalog = DeviceCatalog::default();
        assert!(matches!(
            catalog.require("nokia-3310"),
            Err(FlowError::DeviceNotFound(_))
        ));
    }
}
