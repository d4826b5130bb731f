//! HTTP/2 cleartext upgrades.
//!
//! Two h2c flavours exist. Prior-knowledge (`PRI * HTTP/2.0`) is negotiated
//! before any request is parsed, and the server's auto connection builder
//! speaks it natively; such requests reach filters already carrying
//! `Version::HTTP_2` and pass straight through. The upgrade flavour
//! (`Upgrade: h2c` with `Connection: HTTP2-Settings`) is handled here: the
//! filter takes over the raw connection, answers 101, and serves the
//! upgraded IO with hyper's HTTP/2 server wired to the same service.

use futures::future::BoxFuture;
use http::header::{CONNECTION, UPGRADE};
use http::{StatusCode, Version};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

use crate::request::Request;
use crate::response::Response;
use crate::server::HyperAdapter;
use crate::service::{ArcService, Filter, Service};

#[derive(Debug, Default, Clone, Copy)]
pub struct H2cFilter;

impl Filter for H2cFilter {
    fn apply(&self, mut req: Request, next: ArcService) -> BoxFuture<'static, Response> {
        Box::pin(async move {
            // prior-knowledge h2c arrives already negotiated
            if req.version() == Version::HTTP_2 {
                return next.call(req).await;
            }
            if !wants_h2c_upgrade(&req) {
                return next.call(req).await;
            }
            let Some(on_upgrade) = req.take_upgrade() else {
                debug!("h2c handshake without an upgradable connection, passing through");
                return next.call(req).await;
            };

            let ctx = req.context().clone();
            let svc = next;
            tokio::spawn(async move {
                let upgraded = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        error!(cause = %e, "h2c upgrade failed");
                        return;
                    }
                };

                // hyper's Upgraded already speaks hyper's IO traits
                let adapter = HyperAdapter::new(svc, ctx);
                if let Err(e) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(upgraded, adapter)
                    .await
                {
                    debug!(cause = %e, "h2c connection closed with error");
                }
            });

            let mut rsp = req.response();
            rsp.set_status(StatusCode::SWITCHING_PROTOCOLS);
            rsp.headers_mut().insert(UPGRADE, "h2c".parse().expect("static header value"));
            rsp.headers_mut().insert(CONNECTION, "Upgrade".parse().expect("static header value"));
            rsp.set_hijacked();
            rsp
        })
    }
}

/// An upgrade-style h2c handshake: `Upgrade` mentions `h2c` and
/// `Connection` mentions `HTTP2-Settings`.
fn wants_h2c_upgrade(req: &Request) -> bool {
    let upgrade = req
        .headers()
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("h2c"));
    let settings = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("http2-settings"));
    upgrade && settings
}
