use crate::config::RecordStoreConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur against the record store
#[derive(Error, Debug)]
pub enum RecordStoreError {
    #[error("record store configuration error: {0}")]
    Config(String),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// A user row. The external id is assigned by the identity layer and is
/// unique and immutable once set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
}

/// Transaction lifecycle status. This pipeline only ever writes `Pending`;
/// the terminal states are set by downstream ML processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

/// A transaction row as returned by the record store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_url: String,
    /// Blob store key kept on the row so the URL can be re-signed later
    pub object_key: String,
    pub status: TransactionStatus,
    pub detected_confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
}

/// Partial update applied to a transaction row
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransactionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Client for the relational record store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up a user by external id. Absent is not an error.
    async fn find_user_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<User>, RecordStoreError>;

    /// Look up a user by external id, inserting a new row if absent.
    ///
    /// An insert conflict means a concurrent request created the same
    /// external id first; the lookup is retried exactly once in that case.
    async fn create_user_if_absent(&self, external_id: &str) -> Result<User, RecordStoreError>;

    /// Insert a transaction row and return the created row
    async fn insert_transaction(
        &self,
        user_id: Uuid,
        image_url: &str,
        object_key: &str,
        status: TransactionStatus,
        detected_confidence: Option<f32>,
    ) -> Result<TransactionRecord, RecordStoreError>;

    /// Partially update a transaction row by id, returning the updated row
    /// or `None` when no row matched
    async fn update_transaction(
        &self,
        transaction_id: Uuid,
        update: &TransactionUpdate,
    ) -> Result<Option<TransactionRecord>, RecordStoreError>;
}

#[derive(Debug, Serialize)]
struct NewTransactionRow<'a> {
    user_id: Uuid,
    image_url: &'a str,
    object_key: &'a str,
    status: TransactionStatus,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detected_confidence: Option<f32>,
}

/// Record store client over a PostgREST-style REST interface
#[derive(Debug)]
pub struct PostgrestRecordStore {
    client: reqwest::Client,
    base_url: String,
    service_role_key: String,
}

impl PostgrestRecordStore {
    /// Create a new record store client
    pub fn new(config: &RecordStoreConfig) -> Result<Self, RecordStoreError> {
        if config.base_url.is_empty() {
            return Err(RecordStoreError::Config(
                "record store base URL is not set".to_string(),
            ));
        }
        if config.service_role_key.is_empty() {
            return Err(RecordStoreError::Config(
                "record store service role key is not set".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RecordStoreError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_role_key: config.service_role_key.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.service_role_key)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.service_role_key),
            )
            .header("Prefer", "return=representation")
    }

    async fn insert_user(&self, external_id: &str) -> Result<UserInsertOutcome, RecordStoreError> {
        let response = self
            .request(reqwest::Method::POST, "users")
            .json(&serde_json::json!({ "external_id": external_id }))
            .send()
            .await
            .map_err(|e| RecordStoreError::Unavailable(format!("user insert failed: {e}")))?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(UserInsertOutcome::Conflict);
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::Unavailable(format!(
                "user insert failed with {status}: {body}"
            )));
        }

        let users: Vec<User> = response
            .json()
            .await
            .map_err(|e| RecordStoreError::Unavailable(format!("user insert response: {e}")))?;

        users
            .into_iter()
            .next()
            .map(UserInsertOutcome::Created)
            .ok_or_else(|| {
                RecordStoreError::Unavailable("user insert returned no rows".to_string())
            })
    }
}

enum UserInsertOutcome {
    Created(User),
    /// A concurrent request inserted the same external id first
    Conflict,
}

#[async_trait]
impl RecordStore for PostgrestRecordStore {
    #[instrument(skip(self))]
    async fn find_user_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<User>, RecordStoreError> {
        let response = self
            .request(reqwest::Method::GET, "users")
            .query(&[
                ("external_id", format!("eq.{external_id}")),
                ("select", "id,external_id".to_string()),
            ])
            .send()
            .await
            .map_err(|e| RecordStoreError::Unavailable(format!("user lookup failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::Unavailable(format!(
                "user lookup failed with {status}: {body}"
            )));
        }

        let users: Vec<User> = response
            .json()
            .await
            .map_err(|e| RecordStoreError::Unavailable(format!("user lookup response: {e}")))?;

        Ok(users.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn create_user_if_absent(&self, external_id: &str) -> Result<User, RecordStoreError> {
        if let Some(user) = self.find_user_by_external_id(external_id).await? {
            debug!(user_id = %user.id, "Found existing user");
            return Ok(user);
        }

        match self.insert_user(external_id).await? {
            UserInsertOutcome::Created(user) => {
                info!(user_id = %user.id, "Created new user");
                Ok(user)
            }
            UserInsertOutcome::Conflict => {
                debug!("User insert conflicted with a concurrent request, retrying lookup");
                self.find_user_by_external_id(external_id)
                    .await?
                    .ok_or_else(|| {
                        RecordStoreError::Unavailable(
                            "user not found after insert conflict".to_string(),
                        )
                    })
            }
        }
    }

    #[instrument(skip(self, image_url, object_key), fields(user_id = %user_id))]
    async fn insert_transaction(
        &self,
        user_id: Uuid,
        image_url: &str,
        object_key: &str,
        status: TransactionStatus,
        detected_confidence: Option<f32>,
    ) -> Result<TransactionRecord, RecordStoreError> {
        let row = NewTransactionRow {
            user_id,
            image_url,
            object_key,
            status,
            created_at: Utc::now(),
            detected_confidence,
        };

        let response = self
            .request(reqwest::Method::POST, "transactions")
            .json(&row)
            .send()
            .await
            .map_err(|e| {
                RecordStoreError::Unavailable(format!("transaction insert failed: {e}"))
            })?;

        let http_status = response.status();
        if !http_status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::Unavailable(format!(
                "transaction insert failed with {http_status}: {body}"
            )));
        }

        let rows: Vec<TransactionRecord> = response.json().await.map_err(|e| {
            RecordStoreError::Unavailable(format!("transaction insert response: {e}"))
        })?;

        let transaction = rows.into_iter().next().ok_or_else(|| {
            RecordStoreError::Unavailable("transaction insert returned no rows".to_string())
        })?;

        info!(transaction_id = %transaction.id, "Created transaction");
        Ok(transaction)
    }

    #[instrument(skip(self, update))]
    async fn update_transaction(
        &self,
        transaction_id: Uuid,
        update: &TransactionUpdate,
    ) -> Result<Option<TransactionRecord>, RecordStoreError> {
        let response = self
            .request(reqwest::Method::PATCH, "transactions")
            .query(&[("id", format!("eq.{transaction_id}"))])
            .json(update)
            .send()
            .await
            .map_err(|e| {
                RecordStoreError::Unavailable(format!("transaction update failed: {e}"))
            })?;

        let http_status = response.status();
        if !http_status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordStoreError::Unavailable(format!(
                "transaction update failed with {http_status}: {body}"
            )));
        }

        let rows: Vec<TransactionRecord> = response.json().await.map_err(|e| {
            RecordStoreError::Unavailable(format!("transaction update response: {e}"))
        })?;

        match rows.into_iter().next() {
            Some(transaction) => Ok(Some(transaction)),
            None => {
                warn!(transaction_id = %transaction_id, "Transaction not found for update");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> PostgrestRecordStore {
        PostgrestRecordStore::new(&RecordStoreConfig {
            base_url: server.uri(),
            service_role_key: "service-key".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    fn user_json(id: Uuid, external_id: &str) -> serde_json::Value {
        serde_json::json!([{ "id": id, "external_id": external_id }])
    }

    fn transaction_json(id: Uuid, user_id: Uuid) -> serde_json::Value {
        serde_json::json!([{
            "id": id,
            "user_id": user_id,
            "image_url": "https://r2.example/deposits/u1/x.png?sig=abc",
            "object_key": "deposits/u1/x.png",
            "status": "pending",
            "detected_confidence": null,
            "created_at": "2024-01-15T10:30:00+00:00"
        }])
    }

    #[test]
    fn test_new_rejects_missing_config() {
        let err = PostgrestRecordStore::new(&RecordStoreConfig {
            base_url: String::new(),
            service_role_key: "k".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap_err();
        assert!(matches!(err, RecordStoreError::Config(_)));

        let err = PostgrestRecordStore::new(&RecordStoreConfig {
            base_url: "https://example.com".to_string(),
            service_role_key: String::new(),
            request_timeout_secs: 5,
        })
        .unwrap_err();
        assert!(matches!(err, RecordStoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_find_user_found() {
        let server = MockServer::start().await;
        let user_id = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .and(query_param("external_id", "eq.u1"))
            .and(header("apikey", "service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json(user_id, "u1")))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let user = store.find_user_by_external_id("u1").await.unwrap();
        assert_eq!(user, Some(User { id: user_id, external_id: "u1".to_string() }));
    }

    #[tokio::test]
    async fn test_find_user_absent() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert_eq!(store.find_user_by_external_id("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_user_server_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let err = store.find_user_by_external_id("u1").await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_create_user_when_absent() {
        let server = MockServer::start().await;
        let user_id = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/users"))
            .and(header("Prefer", "return=representation"))
            .respond_with(ResponseTemplate::new(201).set_body_json(user_json(user_id, "u1")))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let user = store.create_user_if_absent("u1").await.unwrap();
        assert_eq!(user.id, user_id);
    }

    #[tokio::test]
    async fn test_create_user_conflict_retries_lookup_once() {
        let server = MockServer::start().await;
        let user_id = Uuid::new_v4();

        // First lookup: absent. Second lookup (after conflict): found.
        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json(user_id, "u1")))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let user = store.create_user_if_absent("u1").await.unwrap();
        assert_eq!(user.id, user_id);
    }

    #[tokio::test]
    async fn test_create_user_conflict_retry_still_absent() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let err = store.create_user_if_absent("u1").await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_insert_transaction_returns_row() {
        let server = MockServer::start().await;
        let transaction_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/rest/v1/transactions"))
            .and(header("Prefer", "return=representation"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(transaction_json(transaction_id, user_id)),
            )
            .mount(&server)
            .await;

        let store = store_for(&server);
        let transaction = store
            .insert_transaction(
                user_id,
                "https://r2.example/deposits/u1/x.png?sig=abc",
                "deposits/u1/x.png",
                TransactionStatus::Pending,
                None,
            )
            .await
            .unwrap();

        assert_eq!(transaction.id, transaction_id);
        assert_eq!(transaction.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_insert_transaction_empty_response_is_unavailable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/transactions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let err = store
            .insert_transaction(
                Uuid::new_v4(),
                "https://r2.example/x",
                "deposits/u1/x.png",
                TransactionStatus::Pending,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecordStoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_update_transaction_absent_row_is_none() {
        let server = MockServer::start().await;
        let transaction_id = Uuid::new_v4();

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/transactions"))
            .and(query_param("id", format!("eq.{transaction_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let update = TransactionUpdate {
            status: Some(TransactionStatus::Completed),
            detected_confidence: Some(0.93),
            ..Default::default()
        };
        let result = store
            .update_transaction(transaction_id, &update)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(TransactionStatus::Completed.as_str(), "completed");
    }

    #[test]
    fn test_update_serializes_only_set_fields() {
        let update = TransactionUpdate {
            detected_confidence: Some(0.5),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({ "detected_confidence": 0.5 }));
    }
}
