//! External lead sources.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::LeadSourceError;
use crate::types::{Lead, LeadIntegration};

#[async_trait]
pub trait LeadSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Leads received by the tenant's account in `[start, end]`.
    ///
    /// Rows without a source id come back with an empty `unique_id`.
    async fn fetch(
        &self,
        integration: &LeadIntegration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lead>, LeadSourceError>;
}

const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// IndiaMART reports and expects times in IST.
fn ist() -> FixedOffset {
    FixedOffset::east_opt(IST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// `DD-Mon-YYYYHH:MM:SS`, e.g. `15-Jan-202410:22:33`.
pub fn format_indiamart_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&ist()).format("%d-%b-%Y%H:%M:%S").to_string()
}

fn parse_query_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    ist()
        .from_local_datetime(&naive)
        .single()
        .map(|at| at.with_timezone(&Utc))
}

fn field(row: &Value, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Maps one `RESPONSE[]` row.
pub fn lead_from_indiamart_row(tenant_id: &str, row: &Value) -> Lead {
    Lead {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.to_string(),
        source: "indiamart".to_string(),
        unique_id: field(row, "UNIQUE_QUERY_ID"),
        query_type: field(row, "QUERY_TYPE"),
        query_time: parse_query_time(&field(row, "QUERY_TIME")),
        sender_name: field(row, "SENDER_NAME"),
        sender_mobile: field(row, "SENDER_MOBILE"),
        sender_email: field(row, "SENDER_EMAIL"),
        sender_company: field(row, "SENDER_COMPANY"),
        city: field(row, "SENDER_CITY"),
        state: field(row, "SENDER_STATE"),
        subject: field(row, "SUBJECT"),
        product_name: field(row, "QUERY_PRODUCT_NAME"),
        message: field(row, "QUERY_MESSAGE"),
        raw: row.clone(),
        created_at: Utc::now(),
    }
}

/// Parses the listing response body. `CODE 204` means no leads in the window.
pub fn parse_indiamart_response(tenant_id: &str, body: &Value) -> Result<Vec<Lead>, LeadSourceError> {
    let code = match body.get("CODE") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    let message = field(body, "MESSAGE");
    match code {
        200 => Ok(body
            .get("RESPONSE")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|row| lead_from_indiamart_row(tenant_id, row))
            .collect()),
        204 => Ok(Vec::new()),
        0 => Err(LeadSourceError::new("INVALID_RESPONSE", "response carried no CODE")),
        other => Err(LeadSourceError::new(
            other.to_string(),
            if message.is_empty() {
                format!("indiamart returned code {other}")
            } else {
                message
            },
        )),
    }
}

pub struct IndiaMartClient {
    http: reqwest::Client,
    api_url: String,
}

impl IndiaMartClient {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl LeadSource for IndiaMartClient {
    fn name(&self) -> &'static str {
        "indiamart"
    }

    async fn fetch(
        &self,
        integration: &LeadIntegration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lead>, LeadSourceError> {
        if integration.api_key.trim().is_empty() {
            return Err(LeadSourceError::new("CONFIG_ERROR", "missing IndiaMART CRM key"));
        }
        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("glusr_crm_key", integration.api_key.trim().to_string()),
                ("start_time", format_indiamart_time(start)),
                ("end_time", format_indiamart_time(end)),
            ])
            .send()
            .await?;

        let status = response.status();
        let raw_body = response.text().await?;
        let body = serde_json::from_str::<Value>(&raw_body).map_err(|_| {
            LeadSourceError::new(
                status.as_u16().to_string(),
                format!("unreadable response: {}", raw_body.chars().take(200).collect::<String>()),
            )
        })?;
        parse_indiamart_response(&integration.tenant_id, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_window_bounds_in_ist() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 4, 52, 33).unwrap();
        assert_eq!(format_indiamart_time(at), "15-Jan-202410:22:33");
    }

    #[test]
    fn maps_response_rows() {
        let body = json!({
            "CODE": 200,
            "STATUS": "SUCCESS",
            "RESPONSE": [{
                "UNIQUE_QUERY_ID": 2793061934u64,
                "QUERY_TYPE": "W",
                "QUERY_TIME": "2024-01-15 10:22:33",
                "SENDER_NAME": "Ravi Kumar",
                "SENDER_MOBILE": "+91-9876543210",
                "SENDER_EMAIL": "ravi@example.in",
                "SENDER_COMPANY": "RK Traders",
                "SENDER_CITY": "Pune",
                "SENDER_STATE": "Maharashtra",
                "SUBJECT": "Requirement for pumps",
                "QUERY_PRODUCT_NAME": "Submersible Pump",
                "QUERY_MESSAGE": "Need 20 units"
            }]
        });
        let leads = parse_indiamart_response("t1", &body).unwrap();
        assert_eq!(leads.len(), 1);
        let lead = &leads[0];
        assert_eq!(lead.unique_id, "2793061934");
        assert_eq!(lead.tenant_id, "t1");
        assert_eq!(lead.city, "Pune");
        assert_eq!(lead.product_name, "Submersible Pump");
        assert_eq!(
            lead.query_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 4, 52, 33).unwrap())
        );
    }

    #[test]
    fn no_leads_and_errors() {
        assert!(parse_indiamart_response("t", &json!({ "CODE": 204, "MESSAGE": "none" }))
            .unwrap()
            .is_empty());
        let err = parse_indiamart_response("t", &json!({ "CODE": 429, "MESSAGE": "Too many requests" }))
            .unwrap_err();
        assert_eq!(err.code, "429");
        assert_eq!(err.message, "Too many requests");
    }
}
