use futures_util::future::BoxFuture;

use crate::errors::Result;
use crate::services::cancel_dispatcher::CancelCommand;
use crate::services::ApiClient;

/// Backend download endpoints used by the progress tracker.
#[derive(Clone)]
pub struct DownloadService {
    api: ApiClient,
}

impl DownloadService {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn cancel_download(&self, operation_id: &str) -> Result<serde_json::Value> {
        self.api
            .post(
                &format!("downloads/{}/cancel", urlencoding::encode(operation_id)),
                serde_json::json!({}),
            )
            .await
    }
}

impl CancelCommand for DownloadService {
    fn cancel_operation<'a>(&'a self, operation_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.cancel_download(operation_id).await?;
            Ok(())
        })
    }
}
