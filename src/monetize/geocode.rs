use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use super::models::GeocodedAddress;
use crate::config::MapsSection;
use crate::errors::GeocodeError;

/// Abstraction over the mapping provider for testability.
/// Real implementation: `GoogleGeocoder`.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<GeocodedAddress, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    formatted_address: String,
    geometry: Geometry,
    #[serde(default)]
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    long_name: String,
    short_name: String,
    #[serde(default)]
    types: Vec<String>,
}

fn component<'a>(components: &'a [AddressComponent], kind: &str) -> Option<&'a AddressComponent> {
    components.iter().find(|c| c.types.iter().any(|t| t == kind))
}

impl GeocodeResponse {
    fn into_address(self, query: &str) -> Result<GeocodedAddress, GeocodeError> {
        match self.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => {
                return Err(GeocodeError::NotFound {
                    address: query.to_string(),
                });
            }
            "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => return Err(GeocodeError::QuotaExceeded),
            other => {
                return Err(GeocodeError::Api {
                    status: other.to_string(),
                    message: self.error_message.unwrap_or_default(),
                });
            }
        }

        let first = self
            .results
            .into_iter()
            .next()
            .ok_or_else(|| GeocodeError::NotFound {
                address: query.to_string(),
            })?;
        let comps = &first.address_components;

        let street = match (
            component(comps, "street_number"),
            component(comps, "route"),
        ) {
            (Some(number), Some(route)) => Some(format!("{} {}", number.long_name, route.long_name)),
            (None, Some(route)) => Some(route.long_name.clone()),
            _ => None,
        };
        let city = component(comps, "locality")
            .or_else(|| component(comps, "postal_town"))
            .map(|c| c.long_name.clone());
        let state = component(comps, "administrative_area_level_1").map(|c| c.short_name.clone());
        let postal_code = component(comps, "postal_code").map(|c| c.long_name.clone());

        Ok(GeocodedAddress {
            formatted_address: first.formatted_address,
            latitude: Some(first.geometry.location.lat),
            longitude: Some(first.geometry.location.lng),
            street,
            city,
            state,
            postal_code,
        })
    }
}

/// Geocoder backed by the Google Geocoding REST API.
pub struct GoogleGeocoder {
    client: reqwest::Client,
    api_key: String,
    geocode_url: String,
}

impl GoogleGeocoder {
    pub fn new(api_key: String, maps: &MapsSection) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_key,
            geocode_url: maps.geocode_url.clone(),
        })
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeocodedAddress, GeocodeError> {
        let response: GeocodeResponse = self
            .client
            .get(&self.geocode_url)
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(GeocodeError::Transport)?
            .error_for_status()
            .map_err(GeocodeError::Transport)?
            .json()
            .await
            .map_err(GeocodeError::Transport)?;

        response.into_address(address)
    }
}

/// Static Maps URL for an overhead satellite view of the coordinates.
pub fn satellite_image_url(
    lat: f64,
    lng: f64,
    maps: &MapsSection,
    api_key: &str,
) -> anyhow::Result<String> {
    let center = format!("{:.6},{:.6}", lat, lng);
    let zoom = maps.zoom.to_string();
    let url = reqwest::Url::parse_with_params(
        &maps.static_map_url,
        &[
            ("center", center.as_str()),
            ("zoom", zoom.as_str()),
            ("size", maps.image_size.as_str()),
            ("maptype", "satellite"),
            ("key", api_key),
        ],
    )
    .with_context(|| format!("Invalid maps.static_map_url '{}'", maps.static_map_url))?;
    Ok(url.into())
}

/// Drop the `key` parameter from a Static Maps URL before it is stored or
/// returned. A URL that does not parse loses its whole query.
pub fn redact_key(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.split('?').next().unwrap_or_default().to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| *k != "key")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&kept);
    }
    parsed.into()
}

/// Download the image and inline it as a `data:` URL so the provider key
/// never leaves this process.
pub async fn fetch_satellite_image(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = client.get(url).send().await?.error_for_status()?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/png")
        .to_string();
    if !content_type.starts_with("image/") {
        anyhow::bail!("Static map returned non-image content type '{}'", content_type);
    }
    let bytes = response.bytes().await?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", content_type, encoded))
}
