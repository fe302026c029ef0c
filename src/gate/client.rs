use async_trait::async_trait;
use serde_json::json;

use super::error::GateError;
use super::types::GateRequest;
use crate::api::{ApiClient, BUILD_PATH};

/// One validation exchange with the remote service.
///
/// Implementations do not retry; that belongs to the state machine.
#[async_trait]
pub trait GateTransport: Send + Sync {
    async fn poll(&self, token: &str, request: &GateRequest) -> Result<String, GateError>;
}

/// HTTP transport for `POST {base}/client/build`
pub struct HttpGateClient {
    api: ApiClient,
    endpoint: String,
}

impl HttpGateClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_api(ApiClient::new(), base_url)
    }

    pub fn with_api(api: ApiClient, base_url: &str) -> Self {
        Self { api, endpoint: build_endpoint(base_url) }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GateTransport for HttpGateClient {
    async fn poll(&self, token: &str, request: &GateRequest) -> Result<String, GateError> {
        self.api.post_json(&self.endpoint, token, &request_body(request)).await
    }
}

/// Append the build path unless the URL already points at it.
pub fn build_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with(BUILD_PATH) {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, BUILD_PATH)
    }
}

pub fn request_body(request: &GateRequest) -> serde_json::Value {
    json!({
        "env": request.environment,
        "product": request.product,
        "subProducts": request.sub_products,
        "buildNumber": request.build.build_number,
        "jobName": request.build.job_name,
        "current": request.attempt.to_string(),
        "end": request.max_attempts.to_string(),
        "jobURL": request.build.job_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::types::BuildIdentity;

    #[test]
    fn test_build_endpoint() {
        assert_eq!(build_endpoint("https://app.armorcode.com"), "https://app.armorcode.com/client/build");
        assert_eq!(build_endpoint("https://app.armorcode.com/"), "https://app.armorcode.com/client/build");
        assert_eq!(build_endpoint("https://x.test/client/build/"), "https://x.test/client/build");
    }

    #[test]
    fn test_request_body_stringifies_attempts() {
        let request = GateRequest {
            product: "p".into(),
            sub_products: vec!["a".into(), "b".into()],
            environment: "prod".into(),
            build: BuildIdentity {
                build_number: "12".into(),
                job_name: "folder/job".into(),
                job_url: "http://ci/job/folder/job/job/".into(),
            },
            attempt: 2,
            max_attempts: 5,
        };
        let body = request_body(&request);
        assert_eq!(body["current"], "2");
        assert_eq!(body["end"], "5");
        assert_eq!(body["subProducts"], json!(["a", "b"]));
        assert_eq!(body["jobURL"], "http://ci/job/folder/job/job/");
    }
}
