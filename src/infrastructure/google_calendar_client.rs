use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::GoogleCalendarEvent;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use url::Url;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";
const EVENTS_PAGE_SIZE: &str = "250";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEventsRequest {
    pub time_min: Option<DateTime<Utc>>,
    pub time_max: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListEventsResponse {
    pub events: Vec<GoogleCalendarEvent>,
    pub next_page_token: Option<String>,
}

/// Event CRUD against an external calendar. One call lists one page.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError>;

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<GoogleCalendarEvent, InfraError>;

    /// `InfraError::NotFound` when the event no longer exists.
    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<GoogleCalendarEvent, InfraError>;

    /// Deleting an event that is already gone succeeds.
    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestGoogleCalendarClient {
    client: Client,
}

impl ReqwestGoogleCalendarClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Provider(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn http_error(status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("google calendar api error: http {}", status.as_u16())
        } else {
            format!("google calendar api error: http {}; body={body}", status.as_u16())
        };
        InfraError::Provider(message)
    }

    fn events_endpoint(calendar_id: &str) -> Result<Url, InfraError> {
        let mut url = Url::parse(CALENDAR_API_BASE).map_err(|error| {
            InfraError::Provider(format!("invalid calendar api base url: {error}"))
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::Provider("calendar api base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("calendars");
            segments.push(calendar_id);
            segments.push("events");
        }
        Ok(url)
    }

    fn event_endpoint(calendar_id: &str, event_id: &str) -> Result<Url, InfraError> {
        let mut url = Self::events_endpoint(calendar_id)?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::Provider("calendar events URL cannot be a base".to_string())
            })?;
            segments.push(event_id);
        }
        Ok(url)
    }

    async fn read_body(response: reqwest::Response, action: &str) -> Result<(StatusCode, String), InfraError> {
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Provider(format!("failed reading event {action} response: {error}"))
        })?;
        Ok((status, body))
    }

    fn parse_event(body: &str, action: &str) -> Result<GoogleCalendarEvent, InfraError> {
        let parsed: GoogleCalendarEvent = serde_json::from_str(body).map_err(|error| {
            InfraError::Provider(format!("invalid event {action} payload: {error}; body={body}"))
        })?;
        if parsed
            .id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .is_none()
        {
            return Err(InfraError::Provider(format!(
                "event {action} response did not include id"
            )));
        }
        Ok(parsed)
    }
}

#[derive(Debug, serde::Deserialize)]
struct EventsPageResponse {
    items: Option<Vec<GoogleCalendarEvent>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[async_trait]
impl CalendarProvider for ReqwestGoogleCalendarClient {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = Self::events_endpoint(calendar_id)?;
        let mut req = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .query(&[("singleEvents", "true"), ("maxResults", EVENTS_PAGE_SIZE)]);
        if let Some(time_min) = request.time_min {
            req = req.query(&[("timeMin", time_min.to_rfc3339_opts(SecondsFormat::Secs, true))]);
        }
        if let Some(time_max) = request.time_max {
            req = req.query(&[("timeMax", time_max.to_rfc3339_opts(SecondsFormat::Secs, true))]);
        }
        if let Some(page_token) = request.page_token.as_deref() {
            req = req.query(&[("pageToken", page_token)]);
        }

        let response = req.send().await.map_err(|error| {
            InfraError::Provider(format!("network error while listing calendar events: {error}"))
        })?;
        let (status, body) = Self::read_body(response, "list").await?;
        if status == StatusCode::NOT_FOUND {
            return Err(InfraError::NotFound(format!("calendar {calendar_id}")));
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let parsed: EventsPageResponse = serde_json::from_str(&body).map_err(|error| {
            InfraError::Provider(format!("invalid events list payload: {error}; body={body}"))
        })?;
        Ok(ListEventsResponse {
            events: parsed.items.unwrap_or_default(),
            next_page_token: parsed
                .next_page_token
                .filter(|value| !value.trim().is_empty()),
        })
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = Self::events_endpoint(calendar_id)?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await
            .map_err(|error| {
                InfraError::Provider(format!("network error while creating event: {error}"))
            })?;

        let (status, body) = Self::read_body(response, "create").await?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Self::parse_event(&body, "create")
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<GoogleCalendarEvent, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        let response = self
            .client
            .put(endpoint)
            .bearer_auth(access_token)
            .json(event)
            .send()
            .await
            .map_err(|error| {
                InfraError::Provider(format!("network error while updating event: {error}"))
            })?;

        let (status, body) = Self::read_body(response, "update").await?;
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(InfraError::NotFound(format!("event {event_id} in {calendar_id}")));
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Self::parse_event(&body, "update")
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let endpoint = Self::event_endpoint(calendar_id, event_id)?;
        let response = self
            .client
            .delete(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| {
                InfraError::Provider(format!("network error while deleting event: {error}"))
            })?;

        let (status, body) = Self::read_body(response, "delete").await?;
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(());
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_endpoints_escape_calendar_and_event_ids() {
        let url = ReqwestGoogleCalendarClient::event_endpoint("team@group.calendar.google.com", "evt/1")
            .expect("valid endpoint");
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/calendar/v3/calendars/team@group.calendar.google.com/events/evt%2F1"
        );
    }

    #[test]
    fn http_error_includes_status_and_body() {
        let error = ReqwestGoogleCalendarClient::http_error(StatusCode::BAD_REQUEST, "{\"error\":1}");
        assert!(matches!(error, InfraError::Provider(message) if message.contains("http 400")));
    }

    #[test]
    fn created_event_must_carry_id() {
        assert!(ReqwestGoogleCalendarClient::parse_event("{\"summary\":\"x\"}", "create").is_err());
        let parsed = ReqwestGoogleCalendarClient::parse_event("{\"id\":\"evt-1\"}", "create")
            .expect("parse event");
        assert_eq!(parsed.id.as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn empty_access_token_is_rejected_before_network() {
        let client = ReqwestGoogleCalendarClient::new();
        let result = client
            .delete_event("  ", "primary", "evt-1")
            .await;
        assert!(matches!(result, Err(InfraError::Provider(_))));
    }
}
