//! Connection-establishment state machines. Host-driven: the host feeds inbound
//! messages and timeouts, and performs the returned [`OutboundAction`]s.

use std::fmt;

use crate::ack::{Ack, Status};
use crate::connection::{
    ConnRequest, ConnResponse, Connection, ProblemReport, ServiceInfo, REQUEST_NOT_ACCEPTED,
    REQUEST_PROCESSING_ERROR, RESPONSE_NOT_ACCEPTED,
};
use crate::context::Endpoint;
use crate::envelope::MessageError;
use crate::identity::Verkey;
use crate::invitation::Invitation;
use crate::message::{Message, ProtocolMessage};
use crate::pairwise::{self, Me, Pairwise, Their};
use crate::wallet::{Wallet, WalletError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Invited,
    Requested,
    Responded,
    Complete,
    /// Absorbing.
    Problem,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Start => "start",
            State::Invited => "invited",
            State::Requested => "requested",
            State::Responded => "responded",
            State::Complete => "complete",
            State::Problem => "problem",
        };
        f.write_str(name)
    }
}

/// One message to hand to the transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub recipient_keys: Vec<Verkey>,
    pub routing_keys: Vec<String>,
    pub endpoint: String,
    /// `None` seals anonymously.
    pub sender_key: Option<Verkey>,
    /// Wait for a correlated reply on the message thread.
    pub expects_reply: bool,
}

/// Action for the host to perform.
#[derive(Debug, Clone)]
pub enum OutboundAction {
    SendMessage(Delivery),
}

#[derive(Debug, Default)]
struct Outcome {
    request_thid: Option<String>,
    pairwise: Option<Pairwise>,
    problem_report: Option<ProblemReport>,
    problem_reason: Option<String>,
}

/// Inviter side: answers a request that arrives under the invitation's connection key.
#[derive(Debug)]
pub struct InviterMachine {
    me: Option<Me>,
    connection_key: Verkey,
    endpoint: Endpoint,
    state: State,
    outcome: Outcome,
}

impl InviterMachine {
    /// The invitation is already published, so the machine starts in `Invited`.
    /// With `me = None` a fresh DID is created for the relationship.
    pub fn new(me: Option<Me>, connection_key: Verkey, endpoint: Endpoint) -> Self {
        Self {
            me,
            connection_key,
            endpoint,
            state: State::Invited,
            outcome: Outcome::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn connection_key(&self) -> &Verkey {
        &self.connection_key
    }

    pub fn request_thid(&self) -> Option<&str> {
        self.outcome.request_thid.as_deref()
    }

    pub fn pairwise(&self) -> Option<&Pairwise> {
        self.outcome.pairwise.as_ref()
    }

    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.outcome.problem_report.as_ref()
    }

    pub fn problem_reason(&self) -> Option<&str> {
        self.outcome.problem_reason.as_deref()
    }

    /// Handle a request that was addressed to `recipient_key`. Requests for any
    /// other key are ignored without a state change.
    ///
    /// The pairwise is prepared but not stored; call [`commit`](Self::commit)
    /// once the response has been delivered.
    pub async fn on_request(
        &mut self,
        wallet: &dyn Wallet,
        recipient_key: &Verkey,
        request: &ConnRequest,
    ) -> Result<Vec<OutboundAction>, HandshakeError> {
        if *recipient_key != self.connection_key {
            tracing::debug!(
                connection_key = %self.connection_key,
                recipient_key = %recipient_key,
                "request for another connection key ignored"
            );
            return Ok(Vec::new());
        }
        self.expect_state(State::Invited)?;
        let thid = request.thread_id();
        self.outcome.request_thid = Some(thid.clone());

        let service = match request.validate() {
            Ok(service) => service,
            Err(e) => {
                let reply_to = request.connection.did_doc.extract_service().ok();
                let report =
                    ProblemReport::new(Some(thid.as_str()), REQUEST_NOT_ACCEPTED, e.to_string());
                return Ok(self.fail(e.to_string(), report, reply_to));
            }
        };
        self.state = State::Requested;
        tracing::debug!(
            thid = %thid,
            their_did = %request.connection.did,
            state = %self.state,
            "request accepted"
        );

        let their = Their {
            did: request.connection.did.clone(),
            verkey: service.recipient_keys[0],
            label: request.label.clone(),
            endpoint: service.endpoint.clone(),
            routing_keys: service.routing_keys.clone(),
        };
        let me = match self.resolve_me(wallet, &their.did).await {
            Ok(me) => me,
            Err(e) => {
                let report = ProblemReport::new(
                    Some(thid.as_str()),
                    REQUEST_PROCESSING_ERROR,
                    e.to_string(),
                );
                return Ok(self.fail(e.to_string(), report, Some(service)));
            }
        };

        let connection = Connection::new(
            &me.did,
            &me.verkey,
            &self.endpoint.address,
            self.endpoint.routing_keys.clone(),
        );
        let response =
            ConnResponse::sign(wallet, &self.connection_key, &thid, &connection).await?;
        self.outcome.pairwise = Some(Pairwise::new(me.clone(), their.clone()));
        self.state = State::Responded;
        tracing::info!(
            thid = %thid,
            their_did = %their.did,
            state = %self.state,
            "response built"
        );

        Ok(vec![OutboundAction::SendMessage(Delivery {
            message: response.into(),
            recipient_keys: vec![their.verkey],
            routing_keys: their.routing_keys,
            endpoint: their.endpoint,
            sender_key: Some(me.verkey),
            expects_reply: true,
        })])
    }

    /// Store the prepared pairwise, or refresh it if the counterpart is already
    /// paired. Returns `true` if a new record was created.
    pub async fn commit(&self, wallet: &dyn Wallet) -> Result<bool, HandshakeError> {
        let pairwise = match (&self.state, &self.outcome.pairwise) {
            (State::Responded | State::Complete, Some(pairwise)) => pairwise,
            _ => return Err(HandshakeError::InvalidState(self.state)),
        };
        let created = pairwise::ensure_exists(wallet, pairwise).await?;
        tracing::debug!(their_did = %pairwise.their.did, created, "pairwise committed");
        Ok(created)
    }

    /// Feed the invitee's reply. An ack or any next-protocol message on the
    /// request thread completes; a failing ack or a problem report moves to
    /// `Problem`. Replies on other threads are ignored.
    pub fn on_reply(&mut self, message: &Message) -> State {
        if self.state != State::Responded {
            return self.state;
        }
        if message.thread_id() != self.outcome.request_thid {
            tracing::debug!(
                kind = message.kind(),
                thid = ?message.thread_id(),
                "reply on another thread ignored"
            );
            return self.state;
        }
        match message {
            Message::Ack(ack) => {
                match ack.status() {
                    Status::Ok | Status::Pending => self.state = State::Complete,
                    Status::Fail => {
                        self.state = State::Problem;
                        self.outcome.problem_reason = Some("peer acknowledged with FAIL".into());
                    }
                }
            }
            Message::ProblemReport(report) => {
                self.state = State::Problem;
                self.outcome.problem_reason = Some(report.explain.clone());
                self.outcome.problem_report = Some(report.clone());
            }
            Message::Unknown(_) => self.state = State::Complete,
            other => {
                tracing::debug!(kind = other.kind(), "reply ignored");
            }
        }
        tracing::debug!(state = %self.state, "inviter reply handled");
        self.state
    }

    /// No reply in time. The relationship stays tentatively established.
    pub fn on_timeout(&mut self) -> Option<&Pairwise> {
        tracing::info!(state = %self.state, "no acknowledgement from invitee");
        self.outcome.pairwise.as_ref()
    }

    async fn resolve_me(&self, wallet: &dyn Wallet, their_did: &str) -> Result<Me, WalletError> {
        if wallet.is_pairwise_exists(their_did).await? {
            let record = wallet.get_pairwise(their_did).await?;
            tracing::info!(their_did, "peer already paired, refreshing");
            let verkey = wallet.key_for_local_did(&record.my_did).await?;
            return Ok(Me {
                did: record.my_did,
                verkey,
            });
        }
        match &self.me {
            Some(me) => Ok(me.clone()),
            None => {
                let (did, verkey) = wallet.create_and_store_my_did(None).await?;
                Ok(Me { did, verkey })
            }
        }
    }

    fn expect_state(&self, expected: State) -> Result<(), HandshakeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HandshakeError::InvalidState(self.state))
        }
    }

    /// Move to `Problem`. The report goes out anonymously: the requester is not authenticated yet.
    fn fail(
        &mut self,
        reason: String,
        report: ProblemReport,
        reply_to: Option<ServiceInfo>,
    ) -> Vec<OutboundAction> {
        tracing::warn!(reason = %reason, "connection request rejected");
        self.state = State::Problem;
        self.outcome.problem_reason = Some(reason);
        self.outcome.problem_report = Some(report.clone());
        match reply_to {
            Some(service) => vec![OutboundAction::SendMessage(Delivery {
                message: report.into(),
                recipient_keys: service.recipient_keys,
                routing_keys: service.routing_keys,
                endpoint: service.endpoint,
                sender_key: None,
                expects_reply: false,
            })],
            None => Vec::new(),
        }
    }
}

/// Invitee side: requests a connection from a parsed invitation.
#[derive(Debug)]
pub struct InviteeMachine {
    me: Me,
    invitation: Invitation,
    label: String,
    endpoint: Endpoint,
    state: State,
    outcome: Outcome,
}

impl InviteeMachine {
    /// Fails on an invitation without recipient keys or routable endpoint.
    pub fn new(
        me: Me,
        invitation: Invitation,
        label: impl Into<String>,
        endpoint: Endpoint,
    ) -> Result<Self, HandshakeError> {
        invitation.validate()?;
        Ok(Self {
            me,
            invitation,
            label: label.into(),
            endpoint,
            state: State::Invited,
            outcome: Outcome::default(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn request_thid(&self) -> Option<&str> {
        self.outcome.request_thid.as_deref()
    }

    pub fn pairwise(&self) -> Option<&Pairwise> {
        self.outcome.pairwise.as_ref()
    }

    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.outcome.problem_report.as_ref()
    }

    pub fn problem_reason(&self) -> Option<&str> {
        self.outcome.problem_reason.as_deref()
    }

    /// Build the request, authenticated and sealed to the invitation's connection key.
    pub fn start(&mut self) -> Result<Vec<OutboundAction>, HandshakeError> {
        if self.state != State::Invited {
            return Err(HandshakeError::InvalidState(self.state));
        }
        let connection_key = self
            .invitation
            .connection_key()
            .ok_or(HandshakeError::InvalidState(self.state))?;
        let connection = Connection::new(
            &self.me.did,
            &self.me.verkey,
            &self.endpoint.address,
            self.endpoint.routing_keys.clone(),
        );
        let request = ConnRequest::new(self.label.clone(), connection);
        self.outcome.request_thid = Some(request.thread_id());
        self.state = State::Requested;
        tracing::debug!(thid = %request.thread_id(), state = %self.state, "request built");
        Ok(vec![OutboundAction::SendMessage(Delivery {
            message: request.into(),
            recipient_keys: vec![connection_key],
            routing_keys: self.invitation.routing_keys.clone(),
            endpoint: self.invitation.endpoint.clone(),
            sender_key: Some(self.me.verkey),
            expects_reply: true,
        })])
    }

    /// Verify the response and persist the pairwise. Verification failures are
    /// logged locally and never answered.
    pub async fn on_response(
        &mut self,
        wallet: &dyn Wallet,
        message: &Message,
    ) -> Result<Vec<OutboundAction>, HandshakeError> {
        if self.state != State::Requested {
            return Err(HandshakeError::InvalidState(self.state));
        }
        let thid = self.outcome.request_thid.clone().unwrap_or_default();
        let response = match message {
            Message::ConnResponse(response) => response,
            Message::ProblemReport(report) => {
                tracing::warn!(
                    thid = %thid,
                    code = %report.problem_code,
                    explain = %report.explain,
                    "inviter reported a problem"
                );
                self.state = State::Problem;
                self.outcome.problem_reason = Some(report.explain.clone());
                self.outcome.problem_report = Some(report.clone());
                return Ok(Vec::new());
            }
            other => {
                self.reject(format!("unexpected {} message", other.kind()));
                return Ok(Vec::new());
            }
        };
        let connection_key = self
            .invitation
            .connection_key()
            .ok_or(HandshakeError::InvalidState(self.state))?;
        let verified = response
            .verify(&connection_key, &thid)
            .and_then(|c| c.did_doc.extract_service().map(|s| (c, s)));
        let (connection, service) = match verified {
            Ok(pair) => pair,
            Err(e) => {
                self.reject(e.to_string());
                return Ok(Vec::new());
            }
        };
        self.state = State::Responded;

        let their = Their {
            did: connection.did,
            verkey: service.recipient_keys[0],
            label: self.invitation.label.clone(),
            endpoint: service.endpoint,
            routing_keys: service.routing_keys,
        };
        let pairwise = Pairwise::new(self.me.clone(), their.clone());
        pairwise::ensure_exists(wallet, &pairwise).await?;
        self.outcome.pairwise = Some(pairwise);
        self.state = State::Complete;
        tracing::info!(
            thid = %thid,
            their_did = %their.did,
            state = %self.state,
            "connection established"
        );

        Ok(vec![OutboundAction::SendMessage(Delivery {
            message: Ack::new(thid, Status::Ok).into(),
            recipient_keys: vec![their.verkey],
            routing_keys: their.routing_keys,
            endpoint: their.endpoint,
            sender_key: Some(self.me.verkey),
            expects_reply: false,
        })])
    }

    /// No response in time.
    pub fn on_timeout(&mut self) {
        if self.state != State::Complete {
            self.reject("timed out waiting for response".into());
        }
    }

    fn reject(&mut self, reason: String) {
        tracing::warn!(reason = %reason, "connection response rejected");
        self.state = State::Problem;
        let thid = self.outcome.request_thid.as_deref();
        self.outcome.problem_report =
            Some(ProblemReport::new(thid, RESPONSE_NOT_ACCEPTED, reason.clone()));
        self.outcome.problem_reason = Some(reason);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("operation not allowed in state {0}")]
    InvalidState(State),
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::InMemoryWallet;

    struct Side {
        wallet: InMemoryWallet,
        me: Me,
        endpoint: Endpoint,
    }

    async fn side(address: &str) -> Side {
        let wallet = InMemoryWallet::new();
        let (did, verkey) = wallet.create_and_store_my_did(None).await.unwrap();
        Side {
            wallet,
            me: Me { did, verkey },
            endpoint: Endpoint::simple(address),
        }
    }

    fn delivery(actions: Vec<OutboundAction>) -> Delivery {
        let mut actions = actions.into_iter();
        let OutboundAction::SendMessage(d) = actions.next().expect("one action");
        assert!(actions.next().is_none());
        d
    }

    /// Seal with the sender wallet and open with the receiver's, as the relay would deliver it.
    async fn transmit(
        from: &InMemoryWallet,
        to: &InMemoryWallet,
        d: &Delivery,
    ) -> (Message, Verkey) {
        let bytes = d.message.encode().unwrap().to_bytes().unwrap();
        let wire = from
            .pack(&bytes, &d.recipient_keys, d.sender_key.as_ref())
            .await
            .unwrap();
        let opened = to.unpack(&wire).await.unwrap();
        let env = crate::envelope::Envelope::from_slice(&opened.plaintext).unwrap();
        (Message::decode(env).unwrap(), opened.recipient_key)
    }

    async fn setup() -> (Side, Side, Verkey, InviterMachine, InviteeMachine) {
        let inviter = side("https://inviter.example/e").await;
        let invitee = side("https://invitee.example/e").await;
        let connection_key = inviter.wallet.create_key(None).await.unwrap();
        let invitation = Invitation::new(
            "Inviter",
            vec![connection_key],
            inviter.endpoint.address.clone(),
            vec![],
        );
        let inviter_machine = InviterMachine::new(
            Some(inviter.me.clone()),
            connection_key,
            inviter.endpoint.clone(),
        );
        let invitee_machine = InviteeMachine::new(
            invitee.me.clone(),
            invitation,
            "Invitee",
            invitee.endpoint.clone(),
        )
        .unwrap();
        (inviter, invitee, connection_key, inviter_machine, invitee_machine)
    }

    #[tokio::test]
    async fn full_exchange_yields_mirror_pairwise() {
        let (inviter, invitee, _, mut a, mut b) = setup().await;

        let req = delivery(b.start().unwrap());
        assert_eq!(b.state(), State::Requested);
        let (msg, recipient) = transmit(&invitee.wallet, &inviter.wallet, &req).await;
        let Message::ConnRequest(request) = msg else { panic!("expected request") };

        let resp = delivery(
            a.on_request(&inviter.wallet, &recipient, &request)
                .await
                .unwrap(),
        );
        assert_eq!(a.state(), State::Responded);
        assert!(resp.expects_reply);
        let (msg, _) = transmit(&inviter.wallet, &invitee.wallet, &resp).await;

        let ack = delivery(b.on_response(&invitee.wallet, &msg).await.unwrap());
        assert_eq!(b.state(), State::Complete);
        let (msg, _) = transmit(&invitee.wallet, &inviter.wallet, &ack).await;
        assert_eq!(a.on_reply(&msg), State::Complete);
        assert!(a.commit(&inviter.wallet).await.unwrap());

        let pa = a.pairwise().unwrap();
        let pb = b.pairwise().unwrap();
        assert_eq!(pa.me.did, pb.their.did);
        assert_eq!(pa.their.did, pb.me.did);
        assert_eq!(pa.their.verkey, pb.me.verkey);
        assert_eq!(pa.their.label, "Invitee");
        assert_eq!(pb.their.label, "Inviter");

        for wallet in [&inviter.wallet, &invitee.wallet] {
            let records = wallet.list_pairwise().await.unwrap();
            assert_eq!(records.len(), 1);
            assert!(records[0].metadata.as_object().is_some_and(|m| !m.is_empty()));
        }
    }

    #[tokio::test]
    async fn request_on_unknown_key_is_ignored() {
        let (inviter, invitee, _, mut a, mut b) = setup().await;
        let req = delivery(b.start().unwrap());
        let (msg, _) = transmit(&invitee.wallet, &inviter.wallet, &req).await;
        let Message::ConnRequest(request) = msg else { panic!("expected request") };
        let other_key = inviter.wallet.create_key(None).await.unwrap();
        let actions = a
            .on_request(&inviter.wallet, &other_key, &request)
            .await
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(a.state(), State::Invited);
    }

    #[tokio::test]
    async fn invalid_request_reports_problem_anonymously() {
        let (inviter, invitee, key, mut a, _) = setup().await;
        let mut request = ConnRequest::new(
            "Invitee",
            Connection::new(
                &invitee.me.did,
                &invitee.me.verkey,
                "https://invitee.example",
                vec![],
            ),
        );
        request.connection.did.clear();
        let report = delivery(a.on_request(&inviter.wallet, &key, &request).await.unwrap());
        assert_eq!(a.state(), State::Problem);
        assert!(report.sender_key.is_none());
        assert!(matches!(
            report.message,
            Message::ProblemReport(ref r) if r.problem_code == REQUEST_NOT_ACCEPTED
        ));
        assert!(inviter.wallet.list_pairwise().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeat_request_reuses_existing_pairwise() {
        let (inviter, invitee, key, mut a, mut b) = setup().await;
        let req = delivery(b.start().unwrap());
        let (msg, _) = transmit(&invitee.wallet, &inviter.wallet, &req).await;
        let Message::ConnRequest(request) = msg else { panic!("expected request") };
        a.on_request(&inviter.wallet, &key, &request).await.unwrap();
        a.commit(&inviter.wallet).await.unwrap();
        let first_me = a.pairwise().unwrap().me.clone();

        let mut again = InviterMachine::new(None, key, inviter.endpoint.clone());
        again.on_request(&inviter.wallet, &key, &request).await.unwrap();
        assert_eq!(again.pairwise().unwrap().me, first_me);
        assert!(!again.commit(&inviter.wallet).await.unwrap());
        assert_eq!(inviter.wallet.list_pairwise().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn forged_response_is_problem_without_reply() {
        let (inviter, invitee, _, _, mut b) = setup().await;
        b.start().unwrap();
        // Signed by a key that is not the invitation's connection key.
        let impostor = inviter.wallet.create_key(None).await.unwrap();
        let connection =
            Connection::new(&inviter.me.did, &inviter.me.verkey, "https://x.example", vec![]);
        let thid = b.request_thid().unwrap().to_string();
        let forged = ConnResponse::sign(&inviter.wallet, &impostor, &thid, &connection)
            .await
            .unwrap();
        let actions = b
            .on_response(&invitee.wallet, &Message::from(forged))
            .await
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(b.state(), State::Problem);
        assert!(b.problem_reason().is_some());
        assert!(invitee.wallet.list_pairwise().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeouts() {
        let (inviter, invitee, key, mut a, mut b) = setup().await;
        let req = delivery(b.start().unwrap());
        b.on_timeout();
        assert_eq!(b.state(), State::Problem);

        let (msg, _) = transmit(&invitee.wallet, &inviter.wallet, &req).await;
        let Message::ConnRequest(request) = msg else { panic!("expected request") };
        a.on_request(&inviter.wallet, &key, &request).await.unwrap();
        assert!(a.on_timeout().is_some());
        assert_eq!(a.state(), State::Responded);
    }

    #[tokio::test]
    async fn invitation_without_keys_is_rejected() {
        let invitee = side("https://invitee.example/e").await;
        let invitation = Invitation::new("x", vec![], "https://inviter.example", vec![]);
        assert!(InviteeMachine::new(invitee.me, invitation, "y", invitee.endpoint).is_err());
    }

    #[tokio::test]
    async fn response_is_not_stored_before_commit() {
        let (inviter, invitee, key, mut a, mut b) = setup().await;
        let req = delivery(b.start().unwrap());
        let (msg, _) = transmit(&invitee.wallet, &inviter.wallet, &req).await;
        let Message::ConnRequest(request) = msg else { panic!("expected request") };

        a.on_request(&inviter.wallet, &key, &request).await.unwrap();
        assert_eq!(a.state(), State::Responded);
        assert!(a.pairwise().is_some());
        assert!(inviter.wallet.list_pairwise().await.unwrap().is_empty());

        assert!(a.commit(&inviter.wallet).await.unwrap());
        assert_eq!(inviter.wallet.list_pairwise().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_without_response_is_invalid() {
        let (inviter, _, _, a, _) = setup().await;
        assert!(matches!(
            a.commit(&inviter.wallet).await,
            Err(HandshakeError::InvalidState(State::Invited))
        ));
    }

    #[tokio::test]
    async fn replies_on_other_threads_are_ignored() {
        let (inviter, invitee, key, mut a, mut b) = setup().await;
        let req = delivery(b.start().unwrap());
        let (msg, _) = transmit(&invitee.wallet, &inviter.wallet, &req).await;
        let Message::ConnRequest(request) = msg else { panic!("expected request") };
        a.on_request(&inviter.wallet, &key, &request).await.unwrap();

        let stray = ProblemReport::new(Some("other-thread"), RESPONSE_NOT_ACCEPTED, "not yours");
        assert_eq!(a.on_reply(&Message::from(stray)), State::Responded);
        let unrelated = crate::envelope::Envelope::from_value(serde_json::json!({
            "@type": "https://didcomm.org/trust_ping/1.0/ping",
            "@id": "ping-1",
            "~thread": {"thid": "other-thread"}
        }))
        .unwrap();
        assert_eq!(a.on_reply(&Message::Unknown(unrelated)), State::Responded);
        assert!(a.problem_report().is_none());

        let thid = a.request_thid().unwrap().to_string();
        let report = ProblemReport::new(Some(thid.as_str()), RESPONSE_NOT_ACCEPTED, "rejected");
        assert_eq!(a.on_reply(&Message::from(report)), State::Problem);
    }
}
