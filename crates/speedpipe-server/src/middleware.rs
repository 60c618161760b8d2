use axum::{
    body::Body,
    http::{HeaderName, Request},
    middleware::Next,
    response::Response,
};
use speedpipe_api::{TRANSACTION_ID_HEADER, TransactionId};

/// Ensures every request carries a UUID transaction id and mirrors it on the
/// response.
///
/// An incoming `transaction-id` that is not a UUID is replaced. The id is
/// stored in the request extensions so the trace span, the auth extractor and
/// handlers all report the same value.
pub async fn transaction_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(TRANSACTION_ID_HEADER);

    let id = TransactionId::from_header(req.headers().get(&header_name));
    if let Some(value) = id.to_header_value() {
        req.headers_mut().insert(header_name.clone(), value);
    }
    req.extensions_mut().insert(id.clone());

    let mut res = next.run(req).await;

    // Add/propagate the transaction id header to response
    if let Some(value) = id.to_header_value() {
        res.headers_mut().insert(header_name, value);
    }
    res
}
