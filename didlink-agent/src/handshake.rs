//! Drives the connection handshake machines over a live agent.

use didlink_core::{
    ConnRequest, Endpoint, Invitation, InviteeMachine, InviterMachine, Me, Message, OutboundAction,
    Pairwise, ProblemReport, State, Verkey,
};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::events::Event;

/// How a handshake attempt ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Pairwise stored. `acknowledged` is false when the invitee never confirmed.
    Established {
        pairwise: Pairwise,
        acknowledged: bool,
    },
    /// The request was for another connection key.
    Ignored,
    Failed {
        reason: String,
        problem_report: Option<ProblemReport>,
    },
}

impl Outcome {
    pub fn pairwise(&self) -> Option<&Pairwise> {
        match self {
            Outcome::Established { pairwise, .. } => Some(pairwise),
            _ => None,
        }
    }
}

/// Answers connection requests addressed to a published invitation key.
pub struct Inviter<'a> {
    agent: &'a Agent,
    me: Option<Me>,
    connection_key: Verkey,
    endpoint: Endpoint,
}

impl<'a> Inviter<'a> {
    pub fn new(
        agent: &'a Agent,
        me: Option<Me>,
        connection_key: Verkey,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            agent,
            me,
            connection_key,
            endpoint,
        }
    }

    /// Run one inviter exchange for `request`, received under `recipient_key`.
    /// The pairwise is stored only once the response was handed to the relay
    /// and the invitee acknowledged it or stayed silent.
    pub async fn create_connection(
        &self,
        recipient_key: &Verkey,
        request: &ConnRequest,
    ) -> Result<Outcome, AgentError> {
        let wallet = self.agent.wallet()?;
        let mut machine =
            InviterMachine::new(self.me.clone(), self.connection_key, self.endpoint.clone());
        let actions = machine.on_request(&**wallet, recipient_key, request).await?;
        if actions.is_empty() && machine.state() == State::Invited {
            return Ok(Outcome::Ignored);
        }

        for OutboundAction::SendMessage(delivery) in actions {
            let sent = self.agent.send_to(&delivery).await;
            if machine.state() == State::Problem {
                if let Err(e) = sent {
                    tracing::warn!(error = %e, "problem report not delivered");
                }
                continue;
            }
            match sent {
                Ok(Some(reply)) => {
                    machine.on_reply(&reply);
                }
                Ok(None) => {}
                Err(AgentError::Timeout) => {
                    machine.on_timeout();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "response not delivered, pairwise discarded");
                    return Err(e);
                }
            }
        }

        Ok(match (machine.state(), machine.pairwise()) {
            (state @ (State::Complete | State::Responded), Some(pairwise)) => {
                machine.commit(&**wallet).await?;
                Outcome::Established {
                    pairwise: pairwise.clone(),
                    acknowledged: state == State::Complete,
                }
            }
            (state, _) => Outcome::Failed {
                reason: machine
                    .problem_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("handshake ended in {state}")),
                problem_report: machine.problem_report().cloned(),
            },
        })
    }

    /// Handle `event` if it is a connection request; anything else is ignored.
    pub async fn handle_event(&self, event: &Event) -> Result<Outcome, AgentError> {
        match (&event.message, &event.recipient_verkey) {
            (Message::ConnRequest(request), Some(recipient_key)) => {
                self.create_connection(recipient_key, request).await
            }
            _ => Ok(Outcome::Ignored),
        }
    }
}

/// Requests a connection from an invitation.
pub struct Invitee<'a> {
    agent: &'a Agent,
    me: Me,
    endpoint: Endpoint,
}

impl<'a> Invitee<'a> {
    pub fn new(agent: &'a Agent, me: Me, endpoint: Endpoint) -> Self {
        Self {
            agent,
            me,
            endpoint,
        }
    }

    pub async fn create_connection(
        &self,
        invitation: Invitation,
        label: &str,
    ) -> Result<Outcome, AgentError> {
        let mut machine =
            InviteeMachine::new(self.me.clone(), invitation, label, self.endpoint.clone())?;
        let actions = machine.start()?;

        for OutboundAction::SendMessage(delivery) in actions {
            match self.agent.send_to(&delivery).await {
                Ok(Some(reply)) => {
                    let acks = machine.on_response(&**self.agent.wallet()?, &reply).await?;
                    for OutboundAction::SendMessage(ack) in acks {
                        if let Err(e) = self.agent.send_to(&ack).await {
                            tracing::warn!(error = %e, "ack not delivered");
                        }
                    }
                }
                Ok(None) | Err(AgentError::Timeout) => machine.on_timeout(),
                Err(e) => return Err(e),
            }
        }

        Ok(match (machine.state(), machine.pairwise()) {
            (State::Complete, Some(pairwise)) => Outcome::Established {
                pairwise: pairwise.clone(),
                acknowledged: true,
            },
            (state, _) => Outcome::Failed {
                reason: machine
                    .problem_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("handshake ended in {state}")),
                problem_report: machine.problem_report().cloned(),
            },
        })
    }
}
