#[cfg(test)]
mod conncheck_test;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use stun::attributes::{ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_PRIORITY, ATTR_USE_CANDIDATE, ATTR_USERNAME};
use stun::error_code::{ErrorCodeAttribute, CODE_BAD_REQUEST, CODE_ROLE_CONFLICT};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{Message, BINDING_ERROR, BINDING_SUCCESS};
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;

use crate::control::{AttrControl, AttrControlled, AttrControlling, Role};
use crate::credentials::CredentialsManager;
use crate::error::Result;
use crate::priority::PriorityAttr;

/// The outcome of examining an inbound Binding Request, handed to the check list engine so it can
/// react (learn a peer-reflexive candidate, schedule a triggered check, confirm a nomination)
/// without this module needing to know about check lists or candidates.
pub struct RequestOutcome {
    pub use_candidate: bool,
    pub priority: u32,
    pub peer_reflexive_from: SocketAddr,
}

/// Outcome of resolving a role conflict signalled by an inbound request's ICE-CONTROLLING/
/// ICE-CONTROLLED attribute against this agent's own role.
pub enum RoleResolution {
    /// No conflicting attribute present; role unaffected.
    NoConflict,
    /// Our tie-breaker won: the peer must switch, we reply 487 and keep our role.
    RejectPeer,
    /// The peer's tie-breaker won: we must switch our role before replying.
    SwitchRole(Role),
}

/// Connectivity-check server: examines and answers inbound Binding Requests per the rules in
/// §4.6. One instance is shared by the whole stack; it is stateless except for its view of this
/// agent's own role and tie-breaker, both of which the stack hands in per call since they can
/// change at runtime when a role conflict flips them.
pub struct ConnCheckServer {
    credentials: Arc<CredentialsManager>,
}

impl ConnCheckServer {
    #[must_use]
    pub fn new(credentials: Arc<CredentialsManager>) -> Self {
        ConnCheckServer { credentials }
    }

    /// Verifies the USERNAME attribute's local half matches `local_ufrag`. Per §4.6, a mismatch is
    /// a silent drop rather than an error response -- it usually just means the request belongs to
    /// a different ICE session sharing this socket.
    #[must_use]
    pub fn matches_local_ufrag(&self, m: &Message, local_ufrag: &str) -> bool {
        let mut username = Username::new(ATTR_USERNAME, String::new());
        if username.get_from(m).is_err() {
            return false;
        }
        username
            .to_string()
            .split(':')
            .next()
            .is_some_and(|ufrag| ufrag == local_ufrag)
    }

    /// Resolves a role conflict per RFC 8445 §7.3.1.1, comparing `our_tie_breaker` against
    /// whichever of ICE-CONTROLLING/ICE-CONTROLLED is present on `m`. Ties and the absence of
    /// either attribute are both `NoConflict`.
    #[must_use]
    pub fn resolve_role_conflict(&self, m: &Message, our_role: Role, our_tie_breaker: u64) -> RoleResolution {
        let mut controlling = AttrControlling(0);
        let mut controlled = AttrControlled(0);

        let peer_tie_breaker = if controlling.get_from(m).is_ok() {
            if our_role == Role::Controlled {
                return RoleResolution::NoConflict;
            }
            controlling.0
        } else if controlled.get_from(m).is_ok() {
            if our_role == Role::Controlling {
                return RoleResolution::NoConflict;
            }
            controlled.0
        } else {
            return RoleResolution::NoConflict;
        };

        if our_tie_breaker >= peer_tie_breaker {
            RoleResolution::RejectPeer
        } else {
            RoleResolution::SwitchRole(our_role.opposite())
        }
    }

    /// Parses a validated Binding Request into a `RequestOutcome`. Per §4.6's documented
    /// workaround for a class of peers that omit USE-CANDIDATE on nominating requests while
    /// controlling, `use_candidate` is true if the attribute is present OR if this agent itself is
    /// not controlling (since only a controlling peer ever sends a nominating request, a
    /// controlled agent can safely treat every inbound request whose peer isn't asserting control
    /// as carrying an implicit nomination once the pair has already succeeded).
    pub fn parse_request(&self, m: &Message, remote: SocketAddr, we_are_controlling: bool) -> Result<RequestOutcome> {
        let mut priority_attr = PriorityAttr(0);
        priority_attr
            .get_from(m)
            .map_err(|_| crate::error::Error::Other("missing PRIORITY attribute".to_owned()))?;

        let use_candidate = m.contains(ATTR_USE_CANDIDATE) || !we_are_controlling;

        Ok(RequestOutcome {
            use_candidate,
            priority: priority_attr.0,
            peer_reflexive_from: remote,
        })
    }

    /// Builds a 487 (Role Conflict) error response to `request`, signed with the credential this
    /// agent would use to answer `request` under `local_ufrag`.
    pub fn build_role_conflict_response(&self, request: &Message, local_ufrag: &str) -> Result<Vec<u8>> {
        let key = self
            .credentials
            .get_local_key(local_ufrag)
            .ok_or_else(|| crate::error::Error::Other(format!("no local credential for {local_ufrag}")))?;

        let mut out = Message::new();
        out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_ROLE_CONFLICT,
                reason: b"Role Conflict".to_vec(),
            }),
            Box::new(MessageIntegrity(key)),
            Box::new(FINGERPRINT),
        ])?;
        Ok(out.raw)
    }

    /// Builds a 400 (Bad Request) error response, used when a required comprehension-required
    /// attribute like PRIORITY is missing.
    pub fn build_bad_request_response(&self, request: &Message, local_ufrag: &str) -> Result<Vec<u8>> {
        let key = self
            .credentials
            .get_local_key(local_ufrag)
            .ok_or_else(|| crate::error::Error::Other(format!("no local credential for {local_ufrag}")))?;

        let mut out = Message::new();
        out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_BAD_REQUEST,
                reason: b"Bad Request".to_vec(),
            }),
            Box::new(MessageIntegrity(key)),
            Box::new(FINGERPRINT),
        ])?;
        Ok(out.raw)
    }

    /// Builds the Binding Success response carrying the request's apparent source as
    /// XOR-MAPPED-ADDRESS, per §4.6.
    pub fn build_success_response(&self, request: &Message, mapped: SocketAddr, local_ufrag: &str) -> Result<Vec<u8>> {
        let key = self
            .credentials
            .get_local_key(local_ufrag)
            .ok_or_else(|| crate::error::Error::Other(format!("no local credential for {local_ufrag}")))?;

        let mut out = Message::new();
        out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: mapped.ip(),
                port: mapped.port(),
            }),
            Box::new(MessageIntegrity(key)),
            Box::new(FINGERPRINT),
        ])?;
        Ok(out.raw)
    }
}
