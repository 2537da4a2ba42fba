//! construction of outgoing messages and extraction of answers

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{Name, Record, RecordType};

use super::errors::Result;
use super::names;

/// Advertised EDNS payload size, also the size of the receive buffers.
pub const DEFAULT_MSG_SIZE: usize = 1232;

/// EDNS option code for the client-subnet option.
const EDNS_CLIENT_SUBNET: u16 = 8;

/// Build a query for `name` and `qtype` with a random id.
///
/// The message carries an OPT record with a zero-length client-subnet
/// option so that upstream recursives do not forward our subnet.
pub fn query_msg(name: &str, qtype: RecordType) -> Result<Message> {
    let name = Name::from_ascii(&names::fqdn(name))?;
    Ok(build_query(name, qtype, false))
}

/// Build a PTR query for the reverse-arpa form of `addr`. Returns `None`
/// when `addr` is not an IP address.
pub fn reverse_msg(addr: &str) -> Option<Message> {
    let ip: IpAddr = addr.parse().ok()?;
    Some(build_query(Name::from(ip), RecordType::PTR, false))
}

/// Build an NSEC query with the DO bit set, used for zone walking.
pub fn walk_msg(name: &str) -> Result<Message> {
    let name = Name::from_ascii(&names::fqdn(name))?;
    Ok(build_query(name, RecordType::NSEC, true))
}

fn build_query(name: Name, qtype: RecordType, dnssec_ok: bool) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));

    let mut edns = Edns::new();
    edns.set_max_payload(DEFAULT_MSG_SIZE as u16);
    edns.set_version(0);
    edns.set_dnssec_ok(dnssec_ok);
    // family = IPv4, source and scope netmask zero: hide the client subnet
    edns.options_mut()
        .insert(EdnsOption::Unknown(EDNS_CLIENT_SUBNET, vec![0, 1, 0, 0]));
    msg.set_edns(edns);

    msg
}

/// The name of the first question, if any.
pub fn question_name(msg: &Message) -> Option<String> {
    msg.queries().first().map(|q| q.name().to_ascii())
}

/// Answers of the given type.
pub fn answers_by_type(msg: &Message, qtype: RecordType) -> Vec<Record> {
    msg.answers()
        .iter()
        .filter(|r| r.record_type() == qtype)
        .cloned()
        .collect()
}

/// The presentation form of a record's data, or `None` for empty records.
pub fn record_data(record: &Record) -> Option<String> {
    record.data().map(|d| d.to_string())
}

/// A flattened answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedAnswer {
    pub name: String,
    pub rtype: RecordType,
    pub data: String,
}

/// Flatten the answer section into `(name, type, data)` triples.
pub fn extract_answers(msg: &Message) -> Vec<ExtractedAnswer> {
    msg.answers()
        .iter()
        .filter_map(|r| {
            let data = record_data(r)?;
            Some(ExtractedAnswer {
                name: names::normalize(&r.name().to_ascii()),
                rtype: r.record_type(),
                data,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::RData;

    #[test]
    fn test_query_msg() {
        let msg = query_msg("example.com", RecordType::A).unwrap();
        assert_eq!(1, msg.queries().len());
        assert_eq!("example.com.", msg.queries()[0].name().to_ascii());
        assert_eq!(RecordType::A, msg.queries()[0].query_type());
        assert!(msg.recursion_desired());

        let edns = msg.edns().expect("edns present");
        assert_eq!(DEFAULT_MSG_SIZE as u16, edns.max_payload());
        assert!(!edns.dnssec_ok());
    }

    #[test]
    fn test_walk_msg_sets_do() {
        let msg = walk_msg("example.com").unwrap();
        assert_eq!(RecordType::NSEC, msg.queries()[0].query_type());
        assert!(msg.edns().unwrap().dnssec_ok());
    }

    #[test]
    fn test_reverse_msg() {
        let msg = reverse_msg("192.168.1.1").expect("valid address");
        assert_eq!(RecordType::PTR, msg.queries()[0].query_type());
        assert_eq!(
            "1.1.168.192.in-addr.arpa.",
            msg.queries()[0].name().to_ascii()
        );

        assert!(reverse_msg("not-an-address").is_none());
    }

    #[test]
    fn test_extract_answers() {
        let mut msg = query_msg("example.com", RecordType::A).unwrap();
        msg.add_answer(Record::from_rdata(
            Name::from_ascii("example.com.").unwrap(),
            300,
            RData::A(A::new(192, 168, 1, 1)),
        ));

        let answers = extract_answers(&msg);
        assert_eq!(1, answers.len());
        assert_eq!("example.com", answers[0].name);
        assert_eq!("192.168.1.1", answers[0].data);

        assert_eq!(1, answers_by_type(&msg, RecordType::A).len());
        assert!(answers_by_type(&msg, RecordType::AAAA).is_empty());
    }
}
