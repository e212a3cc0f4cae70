//! Local-network extractor for admin handlers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;

use crate::error::AppError;
use crate::state::AppState;

/// Proof that the request came from a loopback or private address.
///
/// When `ADMIN_LOCAL_ONLY=false` every peer passes. Requests without
/// connection info (the server was not started with
/// `into_make_service_with_connect_info`) are refused.
///
/// ```ignore
/// async fn my_handler(LocalAdmin(peer): LocalAdmin) -> AppResult<Json<()>> {
///     tracing::info!(%peer, "admin request");
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LocalAdmin(pub Option<SocketAddr>);

impl FromRequestParts<AppState> for LocalAdmin {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        if !state.config.admin_local_only {
            return Ok(LocalAdmin(peer));
        }

        match peer {
            Some(addr) if is_local(addr.ip()) => Ok(LocalAdmin(Some(addr))),
            Some(addr) => {
                tracing::warn!(peer = %addr, "Admin request from non-local address refused");
                Err(AppError::Forbidden(
                    "Admin access is limited to the local network".into(),
                ))
            }
            None => Err(AppError::Forbidden("Peer address unavailable".into())),
        }
    }
}

/// Loopback, RFC 1918, link-local, or IPv6 unique-local.
pub fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_local_v4(v4),
            None => is_local_v6(v6),
        },
    }
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local()
}

fn is_local_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
}
