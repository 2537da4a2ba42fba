//! End-to-end tests of the dispatch engine against loopback DNS servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use swarmdns::resolve::conn::ConnPool;
use swarmdns::resolve::msgs;
use swarmdns::resolve::nameserver::Nameserver;
use swarmdns::resolve::pool::Pool;
use swarmdns::resolve::request::is_no_response;
use swarmdns::resolve::selectors::Selector;

/// Handler turning one query into an optional reply. `None` means the
/// server stays silent.
type Handler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

fn reply_to(query: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .add_queries(query.queries().to_vec());
    resp
}

fn a_record(query: &Message, octets: [u8; 4]) -> Message {
    let mut resp = reply_to(query);
    let name = query.queries()[0].name().clone();
    resp.add_answer(Record::from_rdata(
        name,
        300,
        RData::A(A::new(octets[0], octets[1], octets[2], octets[3])),
    ));
    resp
}

/// Serve `udp` and `tcp` handlers on the same loopback address.
async fn spawn_dns_server(udp: Handler, tcp: Handler) -> SocketAddr {
    spawn_dns_server_on("127.0.0.1", udp, tcp).await
}

/// Like [`spawn_dns_server`] with an explicit loopback host, so tests can
/// stand up several servers distinguishable by source address.
async fn spawn_dns_server_on(host: &str, udp: Handler, tcp: Handler) -> SocketAddr {
    let socket = UdpSocket::bind((host, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(_) => break,
            };
            let query = match Message::from_vec(&buf[..len]) {
                Ok(query) => query,
                Err(_) => continue,
            };
            if let Some(resp) = udp(&query) {
                let _ = socket.send_to(&resp.to_vec().unwrap(), src).await;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tcp = Arc::clone(&tcp);
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut body = vec![0u8; len];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                let query = match Message::from_vec(&body) {
                    Ok(query) => query,
                    Err(_) => return,
                };
                if let Some(resp) = tcp(&query) {
                    let wire = resp.to_vec().unwrap();
                    let _ = stream.write_all(&(wire.len() as u16).to_be_bytes()).await;
                    let _ = stream.write_all(&wire).await;
                }
            });
        }
    });

    addr
}

fn single_pool(addr: SocketAddr, timeout: Duration) -> Pool {
    let ns = Nameserver::from_addr(addr, timeout);
    let selector = Arc::new(Selector::single(ns));
    let conns = ConnPool::new(1, Arc::clone(&selector)).unwrap();
    Pool::new(0, selector, conns)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_a_query() {
    let handler: Handler = Arc::new(|query| {
        if query.queries()[0].name().to_ascii() == "caffix.net." {
            Some(a_record(query, [192, 168, 1, 1]))
        } else {
            let mut resp = reply_to(query);
            resp.set_response_code(ResponseCode::NXDomain);
            Some(resp)
        }
    });
    let addr = spawn_dns_server(Arc::clone(&handler), handler).await;
    let pool = single_pool(addr, Duration::from_secs(2));

    let resp = pool
        .exchange(msgs::query_msg("caffix.net", RecordType::A).unwrap())
        .await
        .expect("query resolves");

    let answers = msgs::extract_answers(&resp);
    assert_eq!(1, answers.len());
    assert_eq!("caffix.net", answers[0].name);
    assert_eq!("192.168.1.1", answers[0].data);

    pool.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unanswered_query_times_out() {
    let silent: Handler = Arc::new(|_| None);
    let addr = spawn_dns_server(Arc::clone(&silent), silent).await;
    let pool = single_pool(addr, Duration::from_millis(250));

    let mut rx = pool.query_channel(msgs::query_msg("slow.example.com", RecordType::A).unwrap());

    let resp = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout sweep delivered")
        .expect("exactly one delivery");
    assert!(is_no_response(&resp));

    // and nothing else arrives
    assert!(rx.recv().await.is_none());

    pool.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncated_reply_falls_back_to_tcp() {
    let udp: Handler = Arc::new(|query| {
        let mut resp = reply_to(query);
        resp.set_truncated(true);
        Some(resp)
    });
    let tcp: Handler = Arc::new(|query| Some(a_record(query, [10, 1, 2, 3])));
    let addr = spawn_dns_server(udp, tcp).await;
    let pool = single_pool(addr, Duration::from_secs(2));

    let resp = pool
        .exchange(msgs::query_msg("big.example.com", RecordType::A).unwrap())
        .await
        .expect("tcp retry resolves");

    assert!(!resp.truncated());
    let answers = msgs::extract_answers(&resp);
    assert_eq!(1, answers.len());
    assert_eq!("10.1.2.3", answers[0].data);

    pool.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bulk_queries_each_deliver_once() {
    let handler: Handler = Arc::new(|query| Some(a_record(query, [10, 0, 0, 1])));
    let addr = spawn_dns_server(Arc::clone(&handler), handler).await;
    let pool = single_pool(addr, Duration::from_secs(2));

    const NAMES: usize = 50;
    let mut channels = Vec::with_capacity(NAMES);
    for i in 0..NAMES {
        let msg = msgs::query_msg(&format!("host{}.example.com", i), RecordType::A).unwrap();
        channels.push(pool.query_channel(msg));
    }

    let mut ok = 0;
    for mut rx in channels {
        let resp = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("every channel delivers")
            .expect("exactly one message");
        if !is_no_response(&resp) && !msgs::extract_answers(&resp).is_empty() {
            ok += 1;
        }
        assert!(rx.recv().await.is_none());
    }

    assert!(ok >= NAMES - 2, "only {} of {} queries succeeded", ok, NAMES);

    pool.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_random_selector_spreads_queries() {
    let handler_a: Handler = Arc::new(|query| Some(a_record(query, [10, 0, 0, 1])));
    let handler_b: Handler = Arc::new(|query| Some(a_record(query, [10, 0, 0, 2])));
    let addr_a = spawn_dns_server_on("127.0.0.1", Arc::clone(&handler_a), handler_a).await;
    let addr_b = spawn_dns_server_on("127.0.0.2", Arc::clone(&handler_b), handler_b).await;

    let selector = Arc::new(Selector::random());
    selector.add(Nameserver::from_addr(addr_a, Duration::from_secs(2)));
    selector.add(Nameserver::from_addr(addr_b, Duration::from_secs(2)));
    let conns = ConnPool::new(2, Arc::clone(&selector)).unwrap();
    let pool = Pool::new(0, selector, conns);

    let mut seen = std::collections::HashSet::new();
    for i in 0..20 {
        let msg = msgs::query_msg(&format!("n{}.example.com", i), RecordType::A).unwrap();
        let resp = pool.exchange(msg).await.expect("resolves");
        for answer in msgs::extract_answers(&resp) {
            seen.insert(answer.data);
        }
    }

    // both upstreams answered at least once
    assert!(seen.contains("10.0.0.1") && seen.contains("10.0.0.2"));

    pool.stop();
}
