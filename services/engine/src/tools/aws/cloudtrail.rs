//! CloudTrail LookupEvents client

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use super::{AwsCredentials, AwsHttp};
use crate::agents::least_privilege::providers::{ActivityApi, EventPage, EventQuery, RawEvent};
use crate::agents::least_privilege::{AccountContext, ResourceRef};

const TARGET: &str = "com.amazonaws.cloudtrail.v20131101.CloudTrail_20131101.LookupEvents";
/// API maximum per page
const PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LookupEventsResponse {
    #[serde(default)]
    events: Vec<TrailEvent>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrailEvent {
    event_id: Option<String>,
    event_name: Option<String>,
    /// Seconds since the epoch, fractional
    event_time: Option<f64>,
    event_source: Option<String>,
    username: Option<String>,
    /// `"true"` / `"false"`
    read_only: Option<String>,
    #[serde(default)]
    resources: Vec<TrailResource>,
    cloud_trail_event: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrailResource {
    resource_type: Option<String>,
    resource_name: Option<String>,
}

fn epoch_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = (secs.fract() * 1e9).round() as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

impl From<TrailEvent> for RawEvent {
    fn from(e: TrailEvent) -> Self {
        Self {
            event_id: e.event_id,
            event_name: e.event_name,
            event_time: e.event_time.and_then(epoch_to_utc),
            event_source: e.event_source,
            username: e.username,
            read_only: e.read_only.map(|r| r.eq_ignore_ascii_case("true")),
            resources: e
                .resources
                .into_iter()
                .map(|r| ResourceRef {
                    resource_type: r.resource_type,
                    resource_name: r.resource_name,
                })
                .collect(),
            detail: e.cloud_trail_event,
        }
    }
}

fn lookup_payload(query: &EventQuery) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "LookupAttributes": [{
            "AttributeKey": "Username",
            "AttributeValue": query.principal,
        }],
        "StartTime": query.start.timestamp(),
        "EndTime": query.end.timestamp(),
        "MaxResults": PAGE_SIZE,
    });
    if let Some(token) = &query.next_token {
        payload["NextToken"] = serde_json::Value::String(token.clone());
    }
    payload
}

fn parse_page(body: serde_json::Value) -> Result<EventPage> {
    let response: LookupEventsResponse =
        serde_json::from_value(body).context("Failed to parse LookupEvents response")?;
    Ok(EventPage {
        events: response.events.into_iter().map(RawEvent::from).collect(),
        next_token: response.next_token.filter(|t| !t.is_empty()),
    })
}

pub struct CloudTrailClient {
    http: AwsHttp,
}

impl CloudTrailClient {
    pub fn new(http: &AwsHttp) -> Self {
        Self { http: http.clone() }
    }
}

#[async_trait]
impl ActivityApi for CloudTrailClient {
    async fn lookup_events(&self, ctx: &AccountContext, query: &EventQuery) -> Result<EventPage> {
        let credentials = AwsCredentials::from(&ctx.credentials);
        let host = format!("cloudtrail.{}.amazonaws.com", self.http.region());

        let body = self
            .http
            .post_json("cloudtrail", &host, &credentials, TARGET, &lookup_payload(query))
            .await
            .with_context(|| format!("LookupEvents for {} failed", query.principal))?;

        parse_page(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_username_and_token() {
        let query = EventQuery {
            principal: "alice".to_string(),
            start: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            end: Utc.timestamp_opt(1_700_043_200, 0).unwrap(),
            next_token: Some("page-2".to_string()),
        };

        let payload = lookup_payload(&query);

        assert_eq!(payload["LookupAttributes"][0]["AttributeKey"], "Username");
        assert_eq!(payload["LookupAttributes"][0]["AttributeValue"], "alice");
        assert_eq!(payload["StartTime"], 1_700_000_000);
        assert_eq!(payload["NextToken"], "page-2");
    }

    #[test]
    fn test_parse_page() {
        let body = serde_json::json!({
            "Events": [{
                "EventId": "a1b2",
                "EventName": "GetObject",
                "ReadOnly": "true",
                "EventTime": 1700000000.5,
                "EventSource": "s3.amazonaws.com",
                "Username": "alice",
                "Resources": [{"ResourceType": "AWS::S3::Bucket", "ResourceName": "reports"}],
                "CloudTrailEvent": "{\"eventVersion\":\"1.08\"}"
            }],
            "NextToken": "next"
        });

        let page = parse_page(body).unwrap();

        assert_eq!(page.next_token.as_deref(), Some("next"));
        let event = &page.events[0];
        assert_eq!(event.read_only, Some(true));
        assert_eq!(event.resources[0].resource_name.as_deref(), Some("reports"));
        assert_eq!(event.event_time.unwrap().timestamp_millis(), 1_700_000_000_500);
        assert!(event.detail.as_deref().unwrap().contains("eventVersion"));
    }

    #[test]
    fn test_empty_response() {
        let page = parse_page(serde_json::json!({})).unwrap();
        assert!(page.events.is_empty());
        assert!(page.next_token.is_none());
    }
}
