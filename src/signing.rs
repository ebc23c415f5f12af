use crate::{
    error::{Result, UdryError},
    protocol::UnlockAction,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Default vendor command endpoint
pub const DEFAULT_VENDOR_ENDPOINT: &str = "https://ttj.mjyun.com/api/v2/cmd";

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Parameters for one signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// Physical device identifier of the stall
    pub dvid: String,
    /// 3-digit token obtained from the machine over BLE
    pub token: String,
    /// 7-digit slot parameter (base offset plus the stall's action slot)
    pub parm: String,
    /// Which physical action the command should drive
    pub action: UnlockAction,
}

/// External authority that converts a machine token into a vendor-trusted
/// unlock command string
///
/// The surrounding system runs two interchangeable implementations (a
/// direct vendor API client and a cloud-function proxy); the engine only
/// depends on this contract, which also keeps it testable with fakes.
#[async_trait]
pub trait CommandSigner: Send + Sync {
    /// Exchange a token for the signed command string to write back over
    /// BLE.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::SigningFailed`] when the vendor rejects the
    /// request, or [`UdryError::Http`] on transport failure.
    async fn sign(&self, request: &SignRequest) -> Result<String>;
}

/// Raw vendor API response body
///
/// `ret == 0` is the documented success condition; `data` then carries the
/// final command string.
#[derive(Debug, Clone, Deserialize)]
pub struct VendorResponse {
    /// Vendor status code, zero on success
    pub ret: i64,
    /// Vendor diagnostic message
    #[serde(default)]
    pub msg: Option<String>,
    /// Signed unlock command string, present on success
    #[serde(default)]
    pub data: Option<String>,
}

impl VendorResponse {
    /// Extract the signed command or a diagnostic error.
    ///
    /// # Errors
    ///
    /// Returns [`UdryError::SigningFailed`] carrying the vendor's message
    /// and code when `ret` is non-zero or the payload is missing.
    pub fn into_unlock_string(self) -> Result<String> {
        if self.ret != 0 {
            let msg = self.msg.unwrap_or_else(|| "unknown error".to_string());
            return Err(UdryError::SigningFailed(format!(
                "Machine API Error: {msg} (Code: {ret})",
                ret = self.ret
            )));
        }
        self.data.ok_or_else(|| {
            UdryError::SigningFailed("Machine API returned success without command data".to_string())
        })
    }
}

/// Direct client for the vendor's command-signing API
///
/// Issues a GET with the credentials and exchange parameters in the query
/// string, matching the vendor's documented invocation.
pub struct VendorApiSigner {
    client: reqwest::Client,
    endpoint: String,
    app_id: String,
    api_key: String,
}

impl VendorApiSigner {
    /// Create a signer against the default vendor endpoint
    #[must_use]
    pub fn new(app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_endpoint(DEFAULT_VENDOR_ENDPOINT, app_id, api_key)
    }

    /// Create a signer against a specific endpoint (proxy deployments)
    #[must_use]
    pub fn with_endpoint(
        endpoint: impl Into<String>,
        app_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
            app_id: app_id.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CommandSigner for VendorApiSigner {
    async fn sign(&self, request: &SignRequest) -> Result<String> {
        info!(
            dvid = %request.dvid,
            parm = %request.parm,
            action = %request.action,
            "Requesting signed unlock command"
        );

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("dvid", request.dvid.as_str()),
                ("appid", self.app_id.as_str()),
                ("key", self.api_key.as_str()),
                ("cmd_type", request.action.cmd_type()),
                ("parm", request.parm.as_str()),
                ("tok", request.token.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: VendorResponse = response.json().await?;
        debug!(ret = body.ret, "Vendor API responded");

        body.into_unlock_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response_yields_command() {
        let body: VendorResponse =
            serde_json::from_str(r#"{"ret":0,"msg":"ok","data":"8F2A11C4"}"#).unwrap();
        assert_eq!(body.into_unlock_string().unwrap(), "8F2A11C4");
    }

    #[test]
    fn test_vendor_rejection_carries_message_and_code() {
        let body: VendorResponse =
            serde_json::from_str(r#"{"ret":1011,"msg":"token expired"}"#).unwrap();
        let error = body.into_unlock_string().unwrap_err();
        let text = format!("{error}");
        assert!(text.contains("token expired"));
        assert!(text.contains("1011"));
    }

    #[test]
    fn test_success_without_data_is_an_error() {
        let body: VendorResponse = serde_json::from_str(r#"{"ret":0}"#).unwrap();
        assert!(body.into_unlock_string().is_err());
    }
}
