//! hosts file support
//!
//! A small scanner splits the file into tokens, `HostsFile` turns those into
//! a name to address table, and `HostsAuthority` answers A and AAAA queries
//! from it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dns::buffer::CodecError;
use crate::dns::netutil::transaction_id;
use crate::dns::protocol::{DnsHeader, DnsMessage, QueryType, ResultCode};
use crate::dns::record::{ResourceRecord, ResourceRecordCollection};
use crate::dns::server::{HandlerError, RequestHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Comment,
    NewLine,
    Whitespace,
    HostOrAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
}

pub struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Tokenizer<'a> {
        Tokenizer { input, pos: 0 }
    }

    fn take_while<F: Fn(char) -> bool>(&mut self, start: usize, pred: F) -> &'a str {
        let rest = &self.input[start..];
        let len = rest.find(|c: char| !pred(c)).unwrap_or(rest.len());
        self.pos = start + len;
        &self.input[start..self.pos]
    }
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\r'
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let start = self.pos;
        let c = self.input[start..].chars().next()?;

        let (kind, text) = match c {
            '#' => (TokenKind::Comment, self.take_while(start, |c| c != '\n')),
            '\n' => {
                self.pos = start + 1;
                (TokenKind::NewLine, &self.input[start..self.pos])
            }
            c if is_blank(c) => (TokenKind::Whitespace, self.take_while(start, is_blank)),
            _ => (
                TokenKind::HostOrAddress,
                self.take_while(start, |c| !is_blank(c) && c != '\n' && c != '#'),
            ),
        };

        Some(Token { kind, text })
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Default, Clone)]
pub struct HostsFile {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsFile {
    pub fn parse(text: &str) -> HostsFile {
        let mut hosts = HostsFile::default();

        let mut line = Vec::new();
        for token in Tokenizer::new(text) {
            match token.kind {
                TokenKind::HostOrAddress => line.push(token.text),
                TokenKind::NewLine => {
                    hosts.add_line(&line);
                    line.clear();
                }
                TokenKind::Comment | TokenKind::Whitespace => {}
            }
        }
        hosts.add_line(&line);

        hosts
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<HostsFile> {
        let text = fs::read_to_string(path)?;
        Ok(HostsFile::parse(&text))
    }

    fn add_line(&mut self, line: &[&str]) {
        let (address, names) = match line.split_first() {
            Some(split) => split,
            None => return,
        };

        let address = match address.parse::<IpAddr>() {
            Ok(address) => address,
            Err(_) => {
                warn!(entry = %address, "skipping hosts entry with invalid address");
                return;
            }
        };

        for name in names {
            let addresses = self.entries.entry(normalize(name)).or_default();
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
    }

    /// Case insensitive; a trailing dot is ignored.
    pub fn lookup(&self, name: &str) -> Option<&[IpAddr]> {
        self.entries.get(&normalize(name)).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct HostsAuthority {
    hosts: HostsFile,
    ttl: u32,
}

impl HostsAuthority {
    pub fn new(hosts: HostsFile) -> HostsAuthority {
        HostsAuthority { hosts, ttl: 3600 }
    }

    pub fn with_ttl(mut self, ttl: u32) -> HostsAuthority {
        self.ttl = ttl;
        self
    }

    fn error_response(id: u16, rescode: ResultCode, max_size: usize) -> Result<Vec<u8>, CodecError> {
        let mut header = DnsHeader::new();
        header.id = id;
        header.response = true;
        header.rescode = rescode;

        DnsMessage::new(
            header,
            Vec::new(),
            ResourceRecordCollection::default(),
            ResourceRecordCollection::default(),
            ResourceRecordCollection::default(),
        )
        .encode(max_size)
    }

    /// Builds the encoded response to `request`, at most `max_size` bytes.
    pub fn answer(&self, request: &[u8], max_size: usize) -> Result<Vec<u8>, CodecError> {
        let query = match DnsMessage::from_bytes(request) {
            Ok(query) => query,
            Err(e) => {
                let id = transaction_id(request).ok_or(e.clone())?;
                debug!(id, error = %e, "malformed request");
                return HostsAuthority::error_response(id, ResultCode::FORMERR, max_size);
            }
        };

        if query.header().response {
            return HostsAuthority::error_response(query.id(), ResultCode::FORMERR, max_size);
        }
        if query.header().opcode != 0 {
            return DnsMessage::response_to(&query)
                .with_rescode(ResultCode::NOTIMP)
                .encode(max_size);
        }

        let mut answers = Vec::new();
        let mut rescode = ResultCode::NOERROR;
        for question in query.questions() {
            let name = question.name.to_text()?;
            let addresses = match self.hosts.lookup(&name) {
                Some(addresses) => addresses,
                None => {
                    debug!(%name, "no hosts entry");
                    rescode = ResultCode::NXDOMAIN;
                    continue;
                }
            };

            for address in addresses {
                let record = match (address, question.qtype) {
                    (IpAddr::V4(ip), QueryType::A | QueryType::ANY) => {
                        ResourceRecord::new(question.name.clone(), QueryType::A, self.ttl, ip.octets().to_vec())
                    }
                    (IpAddr::V6(ip), QueryType::AAAA | QueryType::ANY) => {
                        ResourceRecord::new(question.name.clone(), QueryType::AAAA, self.ttl, ip.octets().to_vec())
                    }
                    _ => continue,
                };
                answers.push(record);
            }
        }

        let response = DnsMessage::response_to(&query)
            .with_answers(answers)
            .with_rescode(rescode);
        let mut header = response.header().clone();
        header.authoritative_answer = true;

        response.with_header(header).encode(max_size)
    }
}

#[async_trait]
impl RequestHandler for HostsAuthority {
    async fn handle(
        &self,
        request: &[u8],
        response: &mut [u8],
        _cancel: &CancellationToken,
    ) -> Result<usize, HandlerError> {
        let encoded = self.answer(request, response.len())?;
        response[..encoded.len()].copy_from_slice(&encoded);

        Ok(encoded.len())
    }
}

#[cfg(test)]
mod tests {

    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::dns::client::{DnsClient, DnsTcpClient};
    use crate::dns::context::{ServerContext, TransportConfig};
    use crate::dns::name::LabelSequence;
    use crate::dns::protocol::DnsQuestion;
    use crate::dns::tcp::DnsTcpServer;

    const HOSTS: &str = "# static table\n\
                         127.0.0.1\tlocalhost LocalHost.localdomain\n\
                         ::1 localhost ip6-localhost # loopback\r\n\
                         \n\
                         10.0.0.1 gateway\n\
                         10.0.0.2 gateway\n\
                         not-an-address broken\n\
                         192.168.1.10 nas.example.com";

    fn authority() -> HostsAuthority {
        HostsAuthority::new(HostsFile::parse(HOSTS)).with_ttl(60)
    }

    fn query(name: &str, qtype: QueryType) -> Vec<u8> {
        DnsMessage::query(0x0102, DnsQuestion::new(name, qtype))
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_tokenizer_kinds() {
        let kinds = Tokenizer::new("1.2.3.4  host # note\r\n::1\thost2")
            .map(|t| (t.kind, t.text))
            .collect::<Vec<_>>();

        assert_eq!(
            vec![
                (TokenKind::HostOrAddress, "1.2.3.4"),
                (TokenKind::Whitespace, "  "),
                (TokenKind::HostOrAddress, "host"),
                (TokenKind::Whitespace, " "),
                (TokenKind::Comment, "# note\r"),
                (TokenKind::NewLine, "\n"),
                (TokenKind::HostOrAddress, "::1"),
                (TokenKind::Whitespace, "\t"),
                (TokenKind::HostOrAddress, "host2"),
            ],
            kinds
        );
    }

    #[test]
    fn test_comment_ends_host_token() {
        let kinds = Tokenizer::new("host#comment")
            .map(|t| t.kind)
            .collect::<Vec<_>>();
        assert_eq!(vec![TokenKind::HostOrAddress, TokenKind::Comment], kinds);
    }

    #[test]
    fn test_hosts_file_parse() {
        let hosts = HostsFile::parse(HOSTS);

        assert_eq!(
            Some(&["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()][..]),
            hosts.lookup("LOCALHOST.")
        );
        assert_eq!(2, hosts.lookup("gateway").unwrap().len());
        assert!(hosts.lookup("localhost.localdomain").is_some());
        assert!(hosts.lookup("nas.example.com").is_some());
        assert!(hosts.lookup("broken").is_none());
        assert_eq!(5, hosts.len());
    }

    #[test]
    fn test_answers_a_query() {
        let response = authority()
            .answer(&query("NAS.example.com", QueryType::A), 512)
            .unwrap();
        let response = DnsMessage::from_bytes(&response).unwrap();

        assert_eq!(0x0102, response.id());
        assert!(response.header().response);
        assert!(response.header().authoritative_answer);
        assert_eq!(ResultCode::NOERROR, response.header().rescode);

        let answers = response.answers().to_vec().unwrap();
        assert_eq!(1, answers.len());
        assert_eq!(QueryType::A, answers[0].rtype);
        assert_eq!(60, answers[0].ttl);
        assert_eq!(&[192, 168, 1, 10][..], &*answers[0].data);
        assert_eq!(LabelSequence::from("nas.example.com"), answers[0].name);
    }

    #[test]
    fn test_answers_by_address_family() {
        let authority = authority();

        let response = authority.answer(&query("localhost", QueryType::AAAA), 512).unwrap();
        let response = DnsMessage::from_bytes(&response).unwrap();
        let answers = response.answers().to_vec().unwrap();
        assert_eq!(1, answers.len());
        assert_eq!(16, answers[0].data.len());

        let response = authority.answer(&query("localhost", QueryType::ANY), 512).unwrap();
        let response = DnsMessage::from_bytes(&response).unwrap();
        assert_eq!(2, response.answers().len());

        let response = authority.answer(&query("gateway", QueryType::AAAA), 512).unwrap();
        let response = DnsMessage::from_bytes(&response).unwrap();
        assert_eq!(ResultCode::NOERROR, response.header().rescode);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn test_unknown_name_is_nxdomain() {
        let response = authority()
            .answer(&query("missing.example.com", QueryType::A), 512)
            .unwrap();
        let response = DnsMessage::from_bytes(&response).unwrap();

        assert_eq!(ResultCode::NXDOMAIN, response.header().rescode);
        assert_eq!(1, response.questions().len());
        assert!(response.answers().is_empty());
    }

    #[test]
    fn test_malformed_requests() {
        let authority = authority();

        let response = authority.answer(&[0x12, 0x34, 0x00], 512).unwrap();
        let response = DnsMessage::from_bytes(&response).unwrap();
        assert_eq!(0x1234, response.id());
        assert_eq!(ResultCode::FORMERR, response.header().rescode);

        assert!(authority.answer(&[0x12], 512).is_err());
    }

    #[test]
    fn test_large_answer_is_truncated() {
        let mut text = String::new();
        for i in 0..100 {
            text.push_str(&format!("10.0.{}.{} many\n", i / 250, i % 250));
        }
        let authority = HostsAuthority::new(HostsFile::parse(&text));

        let response = authority.answer(&query("many", QueryType::A), 512).unwrap();
        assert!(response.len() <= 512);

        let response = DnsMessage::from_bytes(&response).unwrap();
        assert!(response.header().truncated_message);
        assert!(response.answers().len() < 100);
        assert!(!response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_served_over_tcp() {
        let context = Arc::new(ServerContext::new(TransportConfig::default()));
        let server = Arc::new(DnsTcpServer::new(context.clone(), Arc::new(authority())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint: SocketAddr = listener.local_addr().unwrap();
        let serving = tokio::spawn(server.serve(listener));

        let client = DnsTcpClient::new(TransportConfig::default());
        let token = CancellationToken::new();

        for (id, name) in [(1u16, "gateway"), (2, "localhost")] {
            let request = DnsMessage::query(id, DnsQuestion::new(name, QueryType::A));
            let response = client.send_query(endpoint, &request, &token).await.unwrap();
            assert_eq!(id, response.id());
            assert!(!response.answers().is_empty());
        }

        let request = DnsMessage::query(3, DnsQuestion::new("localhost", QueryType::A));
        let response = client.send_query(endpoint, &request, &token).await.unwrap();
        let answer = response.answers().iter().next().unwrap().unwrap();
        assert_eq!(Ipv4Addr::LOCALHOST.octets(), &answer.data[..]);

        context.shutdown.cancel();
        serving.await.unwrap().unwrap();
    }
}
