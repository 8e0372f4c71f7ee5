use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::headers::{call_context, PaymentHeaders};
use crate::{
    observer::{CallOutcome, CallPhase, Decision, PaymentObserver},
    state::{FreeCallService, PaymentChannelService},
    types::{CallContext, ChannelError, ConsumedIncome, FreeCallClaim, PaymentClaim},
    utils::crypto::{verify_claim, verify_free_call},
    validator::IncomeValidator,
};

/// Everything the payment middleware needs to judge a call.
#[derive(Clone)]
pub struct PaymentGate {
    pub channels: Arc<PaymentChannelService>,
    /// `None` when free calls are disabled.
    pub free_calls: Option<Arc<FreeCallService>>,
    pub validator: Arc<dyn IncomeValidator>,
    pub observer: Arc<dyn PaymentObserver>,
}

fn advance(phase: &mut CallPhase, next: CallPhase) {
    tracing::trace!(from = ?*phase, to = ?next, "call phase");
    *phase = next;
}

impl PaymentGate {
    async fn authorize_escrow(
        &self,
        claim: &PaymentClaim,
        context: &CallContext,
        phase: &mut CallPhase,
    ) -> Result<ConsumedIncome, ChannelError> {
        // Lock-free: signer comes from the current channel view.
        let channel = self.channels.get_channel(claim.channel_id).await?;
        verify_claim(claim, channel.signer)?;
        advance(phase, CallPhase::SignatureChecked);

        let authorized = self
            .channels
            .authorize_increment(claim, self.validator.as_ref(), context)
            .await?;
        Ok(ConsumedIncome {
            channel_id: Some(claim.channel_id),
            income: authorized.income,
            authorized_total: authorized.record.authorized_amount,
        })
    }

    async fn authorize_free_call(
        &self,
        claim: &FreeCallClaim,
        context: &CallContext,
        phase: &mut CallPhase,
    ) -> Result<ConsumedIncome, ChannelError> {
        let free_calls = self
            .free_calls
            .as_ref()
            .ok_or(ChannelError::FreeCallsDisabled)?;
        verify_free_call(claim, free_calls.group_id())?;
        advance(phase, CallPhase::SignatureChecked);

        let authorized = free_calls.authorize_call(claim, context).await?;
        Ok(ConsumedIncome {
            channel_id: None,
            income: authorized.income,
            authorized_total: authorized.record.calls_used,
        })
    }

    /// Decides one call. Nothing is forwarded unless this returns `Ok`.
    pub async fn check(
        &self,
        payment: &PaymentHeaders,
        context: &CallContext,
        phase: &mut CallPhase,
    ) -> Result<ConsumedIncome, ChannelError> {
        match payment {
            PaymentHeaders::Escrow(claim) => self.authorize_escrow(claim, context, phase).await,
            PaymentHeaders::FreeCall(claim) => {
                self.authorize_free_call(claim, context, phase).await
            }
        }
    }
}

pub async fn payment_middleware(
    State(gate): State<PaymentGate>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let mut phase = CallPhase::Received;
    let context = call_context(
        request.method().as_str(),
        request.uri().path(),
        request.headers(),
    );

    let payment = match PaymentHeaders::parse(request.headers()) {
        Ok(payment) => payment,
        Err(e) => {
            gate.observer
                .record(&CallOutcome::rejected(None, &context.path, &e));
            return e.into_response();
        }
    };
    let channel_id = match &payment {
        PaymentHeaders::Escrow(claim) => Some(claim.channel_id),
        PaymentHeaders::FreeCall(_) => None,
    };

    match gate.check(&payment, &context, &mut phase).await {
        Ok(consumed) => {
            advance(&mut phase, CallPhase::Authorized);
            let income = consumed.income;
            request.extensions_mut().insert(consumed);

            advance(&mut phase, CallPhase::Forwarded);
            let response = next.run(request).await;
            advance(&mut phase, CallPhase::Completed);

            gate.observer.record(&CallOutcome {
                channel_id,
                path: context.path,
                phase,
                decision: Decision::Approved { income },
            });
            response
        }
        Err(e) => {
            advance(&mut phase, CallPhase::Rejected);
            gate.observer
                .record(&CallOutcome::rejected(channel_id, &context.path, &e));
            e.into_response()
        }
    }
}

/// Used when the ledger is disabled: every call goes through unchecked.
pub async fn bypass_middleware(
    State(observer): State<Arc<dyn PaymentObserver>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    observer.record(&CallOutcome {
        channel_id: None,
        path,
        phase: CallPhase::Completed,
        decision: Decision::Bypassed,
    });
    response
}
