//! `MailboxSession` over async-imap with rustls
use async_imap::imap_proto::{Response, Status};
use async_imap::types::Fetch;
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::{Result, TriageError};
use crate::mailbox::{Envelope, MailboxConnector, MailboxSession, MailboxStatus};
use crate::models::Account;

type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connects to IMAPS (implicit TLS) servers
#[derive(Clone)]
pub struct ImapConnector {
    tls: TlsConnector,
}

impl ImapConnector {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, account: &Account, password: &str) -> Result<Box<dyn MailboxSession>> {
        info!(host = %account.host, port = account.port, "Connecting to IMAP server");

        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((account.host.as_str(), account.port)),
        )
        .await
        .map_err(|_| TriageError::MailboxError(format!("connection to {} timed out", account.host)))??;

        let server_name = ServerName::try_from(account.host.clone())
            .map_err(|e| TriageError::MailboxError(format!("invalid host '{}': {}", account.host, e)))?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| TriageError::MailboxError(format!("TLS handshake failed: {}", e)))?;

        let mut client = async_imap::Client::new(tls);
        let greeting = client
            .read_response()
            .await
            .ok_or_else(|| TriageError::MailboxError(format!("{} closed before greeting", account.host)))??;
        check_greeting(greeting.parsed())?;

        let session = client
            .login(&account.username, password)
            .await
            .map_err(|(e, _)| TriageError::MailboxError(format!("login failed: {}", e)))?;

        debug!(account = account.id, "IMAP login succeeded");
        Ok(Box::new(ImapMailboxSession { session }))
    }
}

/// Accept an `OK` or `PREAUTH` greeting; `BYE` means the server refused us
fn check_greeting(response: &Response<'_>) -> Result<()> {
    match response {
        Response::Data {
            status: Status::Ok | Status::PreAuth,
            ..
        } => Ok(()),
        Response::Data {
            status, information, ..
        } => Err(TriageError::MailboxError(format!(
            "server greeting {:?}: {}",
            status,
            information.as_deref().unwrap_or("")
        ))),
        other => Err(TriageError::MailboxError(format!("unexpected greeting {:?}", other))),
    }
}

pub struct ImapMailboxSession {
    session: ImapSession,
}

fn lossy(bytes: Option<&[u8]>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default()
}

fn envelope_of(fetch: &Fetch) -> Option<Envelope> {
    let envelope = fetch.envelope()?;
    let sender = envelope
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(|addr| {
            format!(
                "{}@{}",
                lossy(addr.mailbox.as_deref()),
                lossy(addr.host.as_deref())
            )
        })
        .unwrap_or_default();

    Some(Envelope {
        subject: lossy(envelope.subject.as_deref()),
        sender,
    })
}

/// Quote a string for use in an IMAP command
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
impl MailboxSession for ImapMailboxSession {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let selected = self.session.select(mailbox).await?;
        Ok(MailboxStatus {
            uid_validity: selected.uid_validity,
            exists: selected.exists,
        })
    }

    async fn search_message_id(&mut self, message_id: &str) -> Result<Option<u32>> {
        let query = format!("HEADER Message-ID {}", quoted(message_id));
        let uids = self.session.uid_search(&query).await?;
        Ok(uids.into_iter().max())
    }

    async fn fetch_envelope(&mut self, uid: u32) -> Result<Option<Envelope>> {
        let fetches: Vec<Fetch> = self
            .session
            .uid_fetch(uid.to_string(), "(UID ENVELOPE)")
            .await?
            .try_collect()
            .await?;
        Ok(fetches
            .iter()
            .find(|fetch| fetch.uid == Some(uid))
            .and_then(envelope_of))
    }

    async fn create_mailbox(&mut self, name: &str) -> Result<()> {
        self.session.create(name).await?;
        Ok(())
    }

    async fn copy_message(&mut self, uid: u32, target: &str) -> Result<()> {
        self.session.uid_copy(uid.to_string(), target).await?;
        Ok(())
    }

    async fn add_flag(&mut self, uid: u32, flag: &str) -> Result<()> {
        let _responses: Vec<Fetch> = self
            .session
            .uid_store(uid.to_string(), format!("+FLAGS ({})", flag))
            .await?
            .try_collect()
            .await?;
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.session.logout().await?;
        Ok(())
    }
}
