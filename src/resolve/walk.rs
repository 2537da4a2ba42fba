//! NSEC zone walking
//!
//! Zones signed with NSEC chain every name to the next one in canonical
//! order. Walking the chain from the apex enumerates the zone without a
//! transfer: each NSEC record's next-domain field is the next query.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::dnssec::rdata::{DNSSECRData, NSEC};
use hickory_proto::rr::RData;

use super::backoff::truncated_exponential_backoff;
use super::errors::ResolveError;
use super::msgs;
use super::names;
use super::pool::Pool;

/// Attempts per chain link before the walk gives up.
const MAX_WALK_ATTEMPTS: u32 = 10;

const WALK_BACKOFF: Duration = Duration::from_millis(250);
const WALK_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// A walk that could not complete. Whatever part of the chain was
/// recovered before the failure is retained.
#[derive(Debug)]
pub struct NsecWalkError {
    pub partial: Vec<NSEC>,
    pub reason: ResolveError,
}

impl fmt::Display for NsecWalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nsec walk broke after {} records: {}",
            self.partial.len(),
            self.reason
        )
    }
}

impl Error for NsecWalkError {}

/// Walk the NSEC chain of `domain` until it closes back on itself.
pub async fn nsec_traversal(pool: &Pool, domain: &str) -> Result<Vec<NSEC>, NsecWalkError> {
    let domain = names::fqdn(&names::normalize(domain));
    let mut chain: Vec<NSEC> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut next = domain.clone();

    loop {
        let nsec = match search_gap(pool, &next).await {
            Ok(Some(nsec)) => nsec,
            Ok(None) => break,
            Err(reason) => {
                return Err(NsecWalkError {
                    partial: chain,
                    reason,
                })
            }
        };

        let next_domain = names::fqdn(&names::normalize(&nsec.next_domain_name().to_ascii()));
        if !visited.insert(next_domain.clone()) {
            break;
        }
        chain.push(nsec);
        if next_domain == domain {
            break;
        }
        next = next_domain;
    }

    Ok(chain)
}

/// Query `name` for its NSEC record. `Ok(None)` is a clean end of the
/// chain (name error or empty response); an error means the server kept
/// answering without ever producing an NSEC record.
async fn search_gap(pool: &Pool, name: &str) -> Result<Option<NSEC>, ResolveError> {
    for attempt in 0..MAX_WALK_ATTEMPTS {
        let msg = msgs::walk_msg(name)?;
        match pool.exchange(msg).await {
            Ok(resp) => {
                if resp.response_code() == ResponseCode::NXDomain {
                    return Ok(None);
                }
                if resp.answers().is_empty() && resp.name_servers().is_empty() {
                    return Ok(None);
                }
                if let Some(nsec) = first_nsec(&resp) {
                    return Ok(Some(nsec));
                }
            }
            Err(e) => {
                log::debug!("nsec query for {} failed: {}", name, e);
            }
        }
        tokio::time::sleep(truncated_exponential_backoff(
            attempt,
            WALK_BACKOFF,
            WALK_BACKOFF_MAX,
        ))
        .await;
    }

    Err(ResolveError::NoResponse)
}

fn first_nsec(resp: &Message) -> Option<NSEC> {
    resp.answers()
        .iter()
        .chain(resp.name_servers())
        .find_map(|record| match record.data() {
            Some(RData::DNSSEC(DNSSECRData::NSEC(nsec))) => Some(nsec.clone()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{Name, Record, RecordType};

    #[test]
    fn test_first_nsec() {
        let mut resp = Message::new();
        let owner = Name::from_ascii("walk.com.").unwrap();
        let next = Name::from_ascii("a.walk.com.").unwrap();
        resp.add_answer(Record::from_rdata(
            owner,
            300,
            RData::DNSSEC(DNSSECRData::NSEC(NSEC::new(
                next.clone(),
                vec![RecordType::A, RecordType::NSEC],
            ))),
        ));

        let nsec = first_nsec(&resp).expect("nsec present");
        assert_eq!(&next, nsec.next_domain_name());

        assert!(first_nsec(&Message::new()).is_none());
    }
}
