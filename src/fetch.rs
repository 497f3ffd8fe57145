//! HTTP access to the weather archive and the reverse geocoder.

use std::future::Future;
use std::{env, fmt};

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable, Aborted};
use futures::{FutureExt, StreamExt, stream};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tqdm::pbar;
use tracing::{debug, info, warn};

use crate::data::{ArchivePayload, WindowRecords};
use crate::plan::WeatherRequest;

pub const DEFAULT_ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";
pub const DEFAULT_GEOCODE_URL: &str = "https://nominatim.openstreetmap.org/reverse";
const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const GEOCODE_ZOOM: &str = "12";

#[derive(Debug)]
pub enum FetchError {
    Request(reqwest::Error),
    Status { status: StatusCode, url: String },
    Decode { url: String, source: serde_json::Error },
    InvalidUrl(String),
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(err) => write!(f, "{err}"),
            Self::Status { status, url } => write!(f, "{url} answered with {status}"),
            Self::Decode { url, source } => write!(f, "Unexpected response from {url}: {source}"),
            Self::InvalidUrl(reason) => write!(f, "Invalid URL: {reason}"),
            Self::Cancelled => f.write_str("Request batch was superseded"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(err) => Some(err),
            Self::Decode { source, .. } => Some(source),
            Self::Status { .. } | Self::InvalidUrl(_) | Self::Cancelled => None,
        }
    }
}

impl From<Aborted> for FetchError {
    fn from(_: Aborted) -> Self {
        Self::Cancelled
    }
}

/// HTTP client that goes through `HTTPS_PROXY` when it is set.
pub fn build_client() -> Result<Client, FetchError> {
    let builder = Client::builder().user_agent(USER_AGENT);
    let builder = match env::var(HTTPS_PROXY_ENV) {
        Ok(val) => {
            info!(proxy = %val, "Using HTTPS proxy");
            let proxy = reqwest::Proxy::https(&val).map_err(FetchError::Request)?;
            builder.proxy(proxy)
        }
        Err(e) => {
            debug!(error = %e, "No HTTPS proxy configured");
            builder
        }
    };
    builder.build().map_err(FetchError::Request)
}

fn parse_url<'a>(
    base: &str,
    params: impl IntoIterator<Item = (&'a str, String)>,
) -> Result<Url, FetchError> {
    Url::parse_with_params(base, params).map_err(|err| FetchError::InvalidUrl(format!("{base}: {err}")))
}

async fn get_bytes(client: &Client, url: Url) -> Result<Bytes, FetchError> {
    let response = client.get(url.clone()).send().await.map_err(FetchError::Request)?;
    let status = response.status();
    if !status.is_success() {
        warn!(status = %status, url = %url, "HTTP request failed");
        return Err(FetchError::Status {
            status,
            url: url.to_string(),
        });
    }
    response.bytes().await.map_err(FetchError::Request)
}

/// Client for the historical hourly archive.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    client: Client,
    base_url: String,
}

impl ArchiveClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn request_url(&self, request: &WeatherRequest) -> Result<Url, FetchError> {
        parse_url(&self.base_url, request.query_pairs())
    }

    /// Fetches one window and keeps the window next to its payloads.
    pub async fn fetch_window(&self, request: &WeatherRequest) -> Result<WindowRecords, FetchError> {
        let url = self.request_url(request)?;
        info!(
            window = request.window.index,
            start = %request.window.start,
            end = %request.window.end,
            "Fetching historical window"
        );
        let body = get_bytes(&self.client, url.clone()).await?;
        let payload: ArchivePayload =
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })?;
        Ok(WindowRecords {
            window: request.window,
            records: payload.into_records(),
        })
    }

    /// Issues every window concurrently and waits for all of them.
    ///
    /// Results keep request order. The first failure fails the whole batch and
    /// drops the requests still running.
    pub async fn fetch_batch(
        &self,
        requests: &[WeatherRequest],
    ) -> Result<Vec<WindowRecords>, FetchError> {
        let mut windows = Vec::with_capacity(requests.len());
        let mut pbar = pbar(Some(requests.len()));
        let mut buffered = stream::iter(requests)
            .map(|request| self.fetch_window(request))
            .buffered(in_flight_limit(requests.len()));

        while let Some(result) = buffered.next().await {
            windows.push(result?);
            if let Err(err) = pbar.update(1) {
                warn!(error = %err, "Failed to update progress bar");
            }
        }
        Ok(windows)
    }
}

/// Every window of a batch is requested at once.
const fn in_flight_limit(requests: usize) -> usize {
    if requests == 0 { 1 } else { requests }
}

/// Owns at most one in-flight batch; starting another aborts the previous one.
#[derive(Debug, Default)]
pub struct FetchSession {
    in_flight: Option<AbortHandle>,
}

impl FetchSession {
    /// Wraps `future` so that the next call to `supersede` or `cancel`
    /// resolves it with [`FetchError::Cancelled`].
    pub fn supersede<F, T>(
        &mut self,
        future: F,
    ) -> impl Future<Output = Result<T, FetchError>> + use<F, T>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        self.cancel();
        let (handle, registration) = AbortHandle::new_pair();
        self.in_flight = Some(handle);
        FutureExt::map(Abortable::new(future, registration), |result| {
            result.unwrap_or_else(|aborted| Err(aborted.into()))
        })
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.in_flight.take()
            && !handle.is_aborted()
        {
            debug!("Aborting superseded request batch");
            handle.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReverseGeocode {
    name: Option<String>,
    address: Option<GeocodeAddress>,
}

#[derive(Debug, Deserialize)]
struct GeocodeAddress {
    city: Option<String>,
}

impl ReverseGeocode {
    fn label(self) -> Option<String> {
        self.address
            .and_then(|address| address.city)
            .or(self.name)
            .filter(|label| !label.trim().is_empty())
    }
}

/// Reverse lookup of place names for stops given only as coordinates.
#[derive(Debug, Clone)]
pub struct Geocoder {
    client: Client,
    base_url: String,
}

impl Geocoder {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<String>, FetchError> {
        let url = parse_url(
            &self.base_url,
            [
                ("format", "json".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("zoom", GEOCODE_ZOOM.to_string()),
                ("layer", "address".to_string()),
            ],
        )?;
        let body = get_bytes(&self.client, url.clone()).await?;
        let place: ReverseGeocode =
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })?;
        Ok(place.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::HistoricalWindow;
    use chrono::NaiveDate;
    use mockito::{Matcher, Server};

    fn request(index: u32, year: i32) -> WeatherRequest {
        WeatherRequest {
            window: HistoricalWindow {
                index,
                start: NaiveDate::from_ymd_opt(year, 4, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(year, 4, 2).unwrap(),
            },
            latitude: "35.6700".to_string(),
            longitude: "139.7900".to_string(),
        }
    }

    fn body(latitude: f64) -> String {
        format!(
            r#"{{"latitude":{latitude},"longitude":139.79,"hourly":{{
                "time":["2024-04-01T00:00","2024-04-01T01:00"],
                "temperature_2m":[10.5,null],
                "precipitation":[0.0,0.1],
                "cloud_cover":[20,30],
                "sunshine_duration":[0,0],
                "is_day":[0,0]}}}}"#
        )
    }

    fn archive(server: &Server) -> ArchiveClient {
        ArchiveClient::new(Client::new(), format!("{}/v1/archive", server.url()))
    }

    #[test]
    fn no_window_waits_for_a_free_slot() {
        assert_eq!(in_flight_limit(5), 5);
        assert_eq!(in_flight_limit(12), 12);
        assert_eq!(in_flight_limit(0), 1);
    }

    #[test]
    fn request_url_carries_every_parameter() {
        let client = ArchiveClient::new(Client::new(), DEFAULT_ARCHIVE_URL);
        let url = client.request_url(&request(1, 2024)).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/v1/archive");
        assert!(pairs.contains(&("latitude".to_string(), "35.6700".to_string())));
        assert!(pairs.contains(&("start_date".to_string(), "2024-04-01".to_string())));
        assert!(pairs.contains(&("end_date".to_string(), "2024-04-02".to_string())));
        assert!(pairs.contains(&(
            "hourly".to_string(),
            "temperature_2m,precipitation,cloud_cover,sunshine_duration,is_day".to_string()
        )));
    }

    #[test]
    fn invalid_base_url_is_reported() {
        let client = ArchiveClient::new(Client::new(), "not a url");
        assert!(matches!(
            client.request_url(&request(1, 2024)),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn batch_keeps_request_order() {
        let mut server = Server::new_async().await;
        let newer = server
            .mock("GET", "/v1/archive")
            .match_query(Matcher::UrlEncoded("start_date".into(), "2024-04-01".into()))
            .with_status(200)
            .with_body(body(1.0))
            .create_async()
            .await;
        let older = server
            .mock("GET", "/v1/archive")
            .match_query(Matcher::UrlEncoded("start_date".into(), "2023-04-01".into()))
            .with_status(200)
            .with_body(format!("[{}]", body(2.0)))
            .create_async()
            .await;

        let windows = archive(&server)
            .fetch_batch(&[request(1, 2024), request(2, 2023)])
            .await
            .unwrap();

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].window.index, 1);
        assert_eq!(windows[0].records[0].latitude, Some(1.0));
        assert_eq!(windows[1].window.index, 2);
        assert_eq!(windows[1].records[0].latitude, Some(2.0));
        assert_eq!(windows[0].records[0].hourly.temperature_2m[1], None);
        newer.assert_async().await;
        older.assert_async().await;
    }

    #[tokio::test]
    async fn one_failed_window_fails_the_batch() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/archive")
            .match_query(Matcher::UrlEncoded("start_date".into(), "2024-04-01".into()))
            .with_status(200)
            .with_body(body(1.0))
            .create_async()
            .await;
        server
            .mock("GET", "/v1/archive")
            .match_query(Matcher::UrlEncoded("start_date".into(), "2023-04-01".into()))
            .with_status(503)
            .create_async()
            .await;

        let err = archive(&server)
            .fetch_batch(&[request(1, 2024), request(2, 2023)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_decode_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/archive")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"reason":"nope"}"#)
            .create_async()
            .await;

        let err = archive(&server).fetch_window(&request(1, 2024)).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn superseded_batch_is_cancelled() {
        let mut session = FetchSession::default();
        let stale = session.supersede(futures::future::pending::<Result<u32, FetchError>>());
        let fresh = session.supersede(async { Ok::<_, FetchError>(7) });

        assert!(matches!(stale.await, Err(FetchError::Cancelled)));
        assert_eq!(fresh.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn reverse_geocode_prefers_city() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/reverse")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("lat".into(), "33.6".into()),
                Matcher::UrlEncoded("zoom".into(), "12".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"name":"Tenjin","address":{"city":"Fukuoka"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/reverse")
            .match_query(Matcher::UrlEncoded("lat".into(), "35.2".into()))
            .with_status(200)
            .with_body(r#"{"name":"Hakone"}"#)
            .create_async()
            .await;

        let geocoder = Geocoder::new(Client::new(), format!("{}/reverse", server.url()));
        assert_eq!(
            geocoder.reverse(33.6, 130.4).await.unwrap().as_deref(),
            Some("Fukuoka")
        );
        assert_eq!(
            geocoder.reverse(35.2, 139.1).await.unwrap().as_deref(),
            Some("Hakone")
        );
    }
}
