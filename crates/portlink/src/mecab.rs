//! Client for the MeCab native helper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::bridge::channel::ChannelFactory;
use crate::config::SessionConfig;
use crate::error::{Result, RpcError};
use crate::session::Session;
use crate::transport::native::{CommandSpawner, NativePortFactory};

/// Native host name the helper is registered under.
pub const MECAB_HOST: &str = "yomitan_mecab";
pub const MECAB_VERSION: u32 = 1;
pub const MECAB_TIMEOUT: Duration = Duration::from_millis(5000);

const PARSE_TEXT: &str = "parse_text";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTerm {
    pub term: String,
    pub reading: String,
    pub source: String,
}

/// Segmentation produced by one MeCab dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseResult {
    pub name: String,
    pub lines: Vec<Vec<ParsedTerm>>,
}

pub struct MecabClient {
    session: Session,
    enabled: AtomicBool,
}

impl MecabClient {
    /// Client over `factory`. Starts disabled.
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        let config = SessionConfig::new(MECAB_HOST)
            .with_default_timeout(MECAB_TIMEOUT)
            .with_handshake_timeout(MECAB_TIMEOUT)
            .with_supported_version(MECAB_VERSION);
        Self::with_config(config, factory)
    }

    pub fn with_config(config: SessionConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            session: Session::new(config, factory),
            enabled: AtomicBool::new(false),
        }
    }

    /// Client that spawns `spawner` as the helper on every connect.
    pub fn native(spawner: CommandSpawner) -> Self {
        Self::new(Arc::new(NativePortFactory::command(spawner)))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Disabling tears down any live connection.
    pub async fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::Relaxed);
        if was && !enabled {
            tracing::debug!("MeCab disabled");
            self.session.disconnect().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Version reported by the helper, or `None` when it cannot be reached.
    pub async fn get_version(&self) -> Option<u32> {
        match self.connect().await {
            Ok(()) => self.session.remote_version(),
            Err(e) => {
                tracing::warn!(error = %e, "MeCab unavailable");
                None
            }
        }
    }

    pub async fn parse_text(&self, text: &str) -> Result<Vec<ParseResult>> {
        self.connect().await?;
        let raw = self
            .session
            .invoke(PARSE_TEXT, json!({ "text": text }), None)
            .await?;
        convert_parse_results(raw)
    }

    async fn connect(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(RpcError::Disconnected);
        }
        self.session.ensure_ready().await
    }
}

/// The helper answers with `{dictionary: [[{expression, reading, source}]]}`.
/// Results keep the helper's dictionary order.
fn convert_parse_results(raw: Value) -> Result<Vec<ParseResult>> {
    let Value::Object(dictionaries) = raw else {
        return Err(RpcError::protocol(format!(
            "parse_text result is not an object: {raw}"
        )));
    };

    Ok(dictionaries
        .into_iter()
        .map(|(name, lines)| ParseResult {
            name,
            lines: array(lines)
                .into_iter()
                .map(|line| array(line).into_iter().map(convert_term).collect())
                .collect(),
        })
        .collect())
}

fn array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

fn convert_term(term: Value) -> ParsedTerm {
    let fields = match term {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    let text = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    ParsedTerm {
        term: text("expression"),
        reading: text("reading"),
        source: text("source"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::Channel;
    use crate::error::SerializedError;
    use crate::peer::{PeerOptions, RequestContext, RequestHandler, serve};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeMecab;

    #[async_trait]
    impl RequestHandler for FakeMecab {
        async fn handle(
            &self,
            action: &str,
            params: Value,
            _ctx: RequestContext,
        ) -> std::result::Result<Value, SerializedError> {
            match (action, params["text"].as_str()) {
                ("parse_text", Some("ねこ")) => Ok(json!({
                    "ipadic": [[
                        {"expression": "ねこ", "reading": "ネコ", "source": "ねこ"}
                    ]]
                })),
                ("parse_text", Some(_)) => Ok(json!({})),
                _ => Err(SerializedError::new("BadRequest", action)),
            }
        }
    }

    struct InProcess {
        opened: AtomicUsize,
        version: u32,
    }

    #[async_trait]
    impl ChannelFactory for InProcess {
        async fn open(&self, peer: &str) -> std::result::Result<Channel, TransportError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (local, remote) = Channel::pair(peer);
            let options = PeerOptions::default().with_version(self.version);
            tokio::spawn(serve(remote, Arc::new(FakeMecab), options));
            Ok(local)
        }
    }

    fn client(version: u32) -> (MecabClient, Arc<InProcess>) {
        let factory = Arc::new(InProcess {
            opened: AtomicUsize::new(0),
            version,
        });
        (MecabClient::new(factory.clone()), factory)
    }

    #[test]
    fn converts_raw_results() {
        let raw = json!({
            "unidic": [
                [
                    {"expression": "猫", "reading": "ネコ", "source": "猫"},
                    {"expression": "だ", "reading": null}
                ],
                []
            ]
        });
        let results = convert_parse_results(raw).unwrap();
        insta::assert_json_snapshot!(results, @r#"
        [
          {
            "name": "unidic",
            "lines": [
              [
                {
                  "term": "猫",
                  "reading": "ネコ",
                  "source": "猫"
                },
                {
                  "term": "だ",
                  "reading": "",
                  "source": ""
                }
              ],
              []
            ]
          }
        ]
        "#);
    }

    #[test]
    fn keeps_helper_dictionary_order() {
        let raw: Value =
            serde_json::from_str(r#"{"unidic": [], "ipadic": [], "jumandic": []}"#).unwrap();
        let names: Vec<_> = convert_parse_results(raw)
            .unwrap()
            .into_iter()
            .map(|result| result.name)
            .collect();
        assert_eq!(names, ["unidic", "ipadic", "jumandic"]);
    }

    #[test]
    fn non_object_result_is_protocol_error() {
        assert!(matches!(
            convert_parse_results(json!([1, 2])),
            Err(RpcError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn disabled_client_never_connects() {
        let (mecab, factory) = client(1);

        assert_eq!(mecab.parse_text("ねこ").await, Err(RpcError::Disconnected));
        assert_eq!(mecab.get_version().await, None);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parses_text_once_enabled() {
        let (mecab, factory) = client(1);
        mecab.set_enabled(true).await;

        assert_eq!(mecab.get_version().await, Some(1));
        let results = mecab.parse_text("ねこ").await.unwrap();
        assert_eq!(
            results,
            vec![ParseResult {
                name: "ipadic".to_string(),
                lines: vec![vec![ParsedTerm {
                    term: "ねこ".to_string(),
                    reading: "ネコ".to_string(),
                    source: "ねこ".to_string(),
                }]],
            }]
        );
        assert!(mecab.is_connected());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabling_disconnects() {
        let (mecab, _factory) = client(1);
        mecab.set_enabled(true).await;
        mecab.parse_text("いぬ").await.unwrap();
        assert!(mecab.is_connected());

        mecab.set_enabled(false).await;
        assert!(!mecab.is_connected());
        assert!(!mecab.is_active());
        assert_eq!(mecab.parse_text("いぬ").await, Err(RpcError::Disconnected));
    }

    #[tokio::test]
    async fn newer_helper_is_rejected() {
        let (mecab, _factory) = client(2);
        mecab.set_enabled(true).await;

        assert_eq!(
            mecab.parse_text("ねこ").await,
            Err(RpcError::UnsupportedVersion {
                reported: 2,
                supported: 1
            })
        );
        assert_eq!(mecab.get_version().await, None);
    }
}
