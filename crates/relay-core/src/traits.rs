use futures::future::BoxFuture;
use futures::StreamExt;

use crate::error::Result;
use crate::types::*;

/// Transport adapter. One implementation per transport.
///
/// Implementations validate the target against their URL policy before
/// any network activity, then perform the transport-specific call.
pub trait Adapter: Send + Sync + 'static {
    /// Adapter name (e.g., "http", "mock").
    fn name(&self) -> &str;

    /// Issue one call for a concrete request config.
    fn execute_request<'a>(&'a self, config: &'a RequestConfig) -> BoxFuture<'a, Result<Response>>;

    /// Narrow a transport response into the output the engine hands onward.
    ///
    /// The default returns a complete body as-is, collects an unread stream
    /// into bytes, and reduces a consumed body to its status and headers.
    fn get_result(&self, response: Response) -> BoxFuture<'_, Result<Output>> {
        Box::pin(async move {
            let meta = response.meta();
            match response.body {
                ResponseBody::Complete(output) => Ok(output),
                ResponseBody::Stream(mut stream) => {
                    let mut buf = Vec::new();
                    while let Some(chunk) = stream.next().await {
                        buf.extend_from_slice(&chunk?);
                    }
                    Ok(Output::Bytes(buf.into()))
                }
                ResponseBody::Consumed => Ok(Output::Json(meta)),
            }
        })
    }
}
