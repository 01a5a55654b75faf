//! Reverse geocoding via the AMap (Gaode) web service. Failures are never
//! fatal: callers fall back to storing raw coordinates.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::models::{LocationData, LocationInput};

const AMAP_API_BASE: &str = "https://restapi.amap.com";
/// Post creation must not stall on a third-party service.
const GEOCODE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseGeocode {
    pub formatted_address: String,
    pub province: String,
    /// Empty for direct municipalities (AMap reports an empty array there);
    /// callers fall back to the province.
    pub city: String,
    pub district: String,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<ReverseGeocode>;
}

#[derive(Deserialize)]
struct AmapResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    infocode: String,
    regeocode: Option<AmapRegeocode>,
}

#[derive(Deserialize)]
struct AmapRegeocode {
    // AMap encodes "no value" as an empty array, so everything is a Value
    #[serde(default)]
    formatted_address: Value,
    #[serde(default, rename = "addressComponent")]
    address_component: AmapAddressComponent,
}

#[derive(Default, Deserialize)]
struct AmapAddressComponent {
    #[serde(default)]
    province: Value,
    #[serde(default)]
    city: Value,
    #[serde(default)]
    district: Value,
}

fn text(v: &Value) -> String {
    v.as_str().unwrap_or("").to_string()
}

pub struct AmapGeocoder {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl AmapGeocoder {
    pub fn from_env() -> Self {
        let base_url = std::env::var("AMAP_API_BASE").unwrap_or_else(|_| AMAP_API_BASE.to_string());
        Self {
            client: reqwest::Client::builder()
                .timeout(GEOCODE_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_key: std::env::var("AMAP_WEB_SERVICE_KEY").ok(),
            base_url,
        }
    }
}

#[async_trait]
impl Geocoder for AmapGeocoder {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<ReverseGeocode> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            log::warn!("rejecting out-of-range coordinates ({latitude}, {longitude})");
            return None;
        }
        let key = match &self.api_key {
            Some(k) => k,
            None => {
                log::warn!("AMap API key is not configured; skipping reverse geocoding");
                return None;
            }
        };

        // AMap expects "longitude,latitude"
        let url = format!("{}/v3/geocode/regeo", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("location", format!("{longitude},{latitude}")),
                ("key", key.clone()),
                ("extensions", "base".to_string()),
            ])
            .send()
            .await;
        let body: AmapResponse = match resp {
            Ok(r) => match r.json().await {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("unparseable AMap response: {e}");
                    return None;
                }
            },
            Err(e) => {
                log::warn!("reverse geocoding request failed: {e}");
                return None;
            }
        };

        if body.status != "1" || body.infocode != "10000" {
            log::warn!("AMap API error: status={} infocode={}", body.status, body.infocode);
            return None;
        }
        let regeo = body.regeocode?;
        Some(ReverseGeocode {
            formatted_address: text(&regeo.formatted_address),
            province: text(&regeo.address_component.province),
            city: text(&regeo.address_component.city),
            district: text(&regeo.address_component.district),
        })
    }
}

/// Resolve the location block of a create-post request. Address fields
/// supplied by the client win; otherwise the geocoder is consulted, and on
/// any failure the raw coordinates are kept with the address fields null.
/// Returns None when no usable coordinates were supplied at all.
pub async fn resolve_location(geocoder: &dyn Geocoder, input: &LocationInput) -> Option<LocationData> {
    let latitude = input.latitude?;
    let longitude = input.longitude?;

    if let (Some(address), Some(city)) = (&input.address, &input.city) {
        return Some(LocationData {
            latitude,
            longitude,
            accuracy: input.accuracy,
            address: Some(address.clone()),
            city: Some(city.clone()),
            province: input.province.clone(),
            district: input.district.clone(),
        });
    }

    match geocoder.reverse_geocode(latitude, longitude).await {
        Some(geo) => {
            // municipalities report no city; fall back to the province
            let city = if geo.city.is_empty() { geo.province.clone() } else { geo.city.clone() };
            Some(LocationData {
                latitude,
                longitude,
                accuracy: input.accuracy,
                address: Some(geo.formatted_address),
                city: Some(city),
                province: Some(geo.province),
                district: Some(geo.district),
            })
        }
        None => Some(LocationData {
            latitude,
            longitude,
            accuracy: input.accuracy,
            address: input.address.clone(),
            city: input.city.clone(),
            province: input.province.clone(),
            district: input.district.clone(),
        }),
    }
}
