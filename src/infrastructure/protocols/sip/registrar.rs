//! REGISTER handling
//!
//! Registrations are not stored here; they are handed to the bus as
//! register/unregister requests and the REGISTER is answered from the
//! outcome.

use super::builder::reason_phrase;
use super::context::SipContext;
use super::dialog::uri_text;
use super::message::SipHeaders;
use super::transaction::Transaction;
use crate::infrastructure::bus::{BusRequest, RegisterRequest};
use rsip::Header;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Check a REGISTER and turn it into a bus request. Requests that cannot be
/// served are answered here and yield `None`.
pub fn prepare(ctx: &SipContext, transaction: &Transaction) -> Option<BusRequest> {
    if ctx.is_exiting() {
        warn!("Dropping REGISTER, shutting down");
        transaction.set_response(500, "Server Shutting Down");
        return None;
    }

    let request = transaction.initial_request();
    let Some(contact) = request.contact() else {
        transaction.set_response(400, reason_phrase(400));
        return None;
    };

    let uri = uri_text(&contact);
    let expires = request.expires();
    let register = RegisterRequest {
        username: request
            .contact_uri()
            .and_then(|u| u.user().map(String::from)),
        data: format!("sip/{}", uri),
        expires: expires.clone(),
        received: transaction.peer(),
    };

    if expires.as_deref() == Some("0") {
        Some(BusRequest::Unregister(register))
    } else {
        Some(BusRequest::Register(register))
    }
}

/// Dispatch a prepared registration and answer the REGISTER
pub async fn complete(ctx: Arc<SipContext>, transaction: Transaction, request: BusRequest) {
    let unregister = matches!(request, BusRequest::Unregister(_));
    let user = match &request {
        BusRequest::Register(r) | BusRequest::Unregister(r) => r.data.clone(),
        _ => String::new(),
    };

    let accepted = ctx.bus.dispatch(request).await.is_some();

    // deregistration is always acknowledged
    if accepted || unregister {
        info!(
            "{} {}",
            if unregister { "Unregistered" } else { "Registered" },
            user
        );
        let initial = transaction.initial_request();
        let mut response = transaction.response(200);
        if let Some(contact) = initial.contact() {
            response = response.header(Header::Contact(contact.into()));
        }
        if let Some(expires) = initial.expires() {
            response = response.header(Header::Expires(expires.into()));
        }
        transaction.set_response_message(response.build_for_request(initial));
    } else {
        debug!("Registration of {} refused", user);
        transaction.set_response(404, reason_phrase(404));
    }
}
