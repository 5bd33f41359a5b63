//! A4 — concrete [`IndexClient`] speaking XML-RPC over the shared retrying
//! HTTP transport.
//!
//! The Index's actual wire protocol is XML-RPC; request bodies are small and
//! fixed so they're built by hand rather than through a general-purpose
//! XML-RPC crate, and responses are parsed with `quick-xml`'s pull parser
//! directly into the loose [`RawValue`]/[`RawRelease`] shapes the rest of
//! the engine works with. A connection-level failure surfaces as
//! [`SyncError::Transport`] (already retried by the transport layer before
//! this adapter ever sees it); an XML-RPC `<fault>` or an unexpected shape
//! surfaces as [`SyncError::Protocol`].

use std::collections::HashMap;
use std::sync::Arc;

use quick_xml::Reader;
use quick_xml::events::Event;

use super::{ChangelogEntry, FileDescriptor, IndexClient, RawRelease, RawValue};
use crate::errors::SyncError;
use crate::retry::RetryingClient;

pub struct XmlRpcIndexClient {
    http: Arc<RetryingClient>,
    base_url: String,
}

impl XmlRpcIndexClient {
    pub fn new(http: Arc<RetryingClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn call(&self, method: &str, params: &[XmlRpcValue]) -> Result<XmlRpcValue, SyncError> {
        let body = encode_call(method, params);

        let response = self
            .http
            .client()
            .post(&self.base_url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(SyncError::Transport)?;

        if !response.status().is_success() {
            return Err(SyncError::Protocol(format!(
                "index returned {} for method {}",
                response.status(),
                method
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| SyncError::Protocol(format!("could not read index response body: {e}")))?;

        decode_response(&text)
    }
}

#[async_trait::async_trait]
impl IndexClient for XmlRpcIndexClient {
    async fn list_packages(&self) -> Result<Vec<String>, SyncError> {
        let value = self.call("list_packages", &[]).await?;
        value.into_string_list()
    }

    async fn changelog(&self, since_epoch: i64) -> Result<Vec<ChangelogEntry>, SyncError> {
        let value = self
            .call("changelog", &[XmlRpcValue::Int(since_epoch)])
            .await?;

        // The Index sometimes returns a single bare entry unwrapped; the
        // adapter normalizes that here so `IndexClient::changelog` always
        // returns a list to its caller.
        let rows = match value {
            XmlRpcValue::Array(items) => items,
            other => vec![other],
        };

        rows.into_iter().map(parse_changelog_row).collect()
    }

    async fn package_releases(
        &self,
        name: &str,
        show_hidden: bool,
    ) -> Result<Vec<String>, SyncError> {
        let value = self
            .call(
                "package_releases",
                &[
                    XmlRpcValue::Str(name.to_string()),
                    XmlRpcValue::Bool(show_hidden),
                ],
            )
            .await?;

        match value {
            XmlRpcValue::Str(s) => Ok(vec![s]),
            other => other.into_string_list(),
        }
    }

    async fn release_data(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<RawRelease>, SyncError> {
        let value = self
            .call(
                "release_data",
                &[
                    XmlRpcValue::Str(name.to_string()),
                    XmlRpcValue::Str(version.to_string()),
                ],
            )
            .await?;

        match value {
            XmlRpcValue::Struct(map) if map.is_empty() => Ok(None),
            XmlRpcValue::Struct(map) => Ok(Some(RawRelease {
                fields: map.into_iter().map(|(k, v)| (k, v.into_raw())).collect(),
            })),
            XmlRpcValue::Nil => Ok(None),
            other => Err(SyncError::Protocol(format!(
                "expected a struct from release_data, got {other:?}"
            ))),
        }
    }

    async fn release_urls(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Vec<FileDescriptor>, SyncError> {
        let value = self
            .call(
                "release_urls",
                &[
                    XmlRpcValue::Str(name.to_string()),
                    XmlRpcValue::Str(version.to_string()),
                ],
            )
            .await?;

        let rows = match value {
            XmlRpcValue::Array(items) => items,
            s @ XmlRpcValue::Struct(_) => vec![s],
            other => {
                return Err(SyncError::Protocol(format!(
                    "do not understand the type returned by release_urls: {other:?}"
                )));
            }
        };

        rows.into_iter().map(parse_file_descriptor).collect()
    }

    async fn fetch_file(&self, descriptor: &FileDescriptor) -> Result<Vec<u8>, SyncError> {
        let response = self
            .http
            .client()
            .get(&descriptor.url)
            .send()
            .await
            .map_err(SyncError::Transport)?;

        if !response.status().is_success() {
            return Err(SyncError::Protocol(format!(
                "fetching {} returned {}",
                descriptor.url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::Protocol(format!("could not read file body: {e}")))?
            .to_vec();

        let actual = format!("{:x}", md5::compute(&bytes));

        if actual != descriptor.md5_digest {
            return Err(SyncError::HashMismatch {
                url: descriptor.url.clone(),
                expected: descriptor.md5_digest.clone(),
                actual,
            });
        }

        Ok(bytes)
    }
}

fn parse_changelog_row(value: XmlRpcValue) -> Result<ChangelogEntry, SyncError> {
    let items = match value {
        XmlRpcValue::Array(items) => items,
        other => {
            return Err(SyncError::Protocol(format!(
                "expected a changelog tuple, got {other:?}"
            )));
        }
    };

    if items.len() != 4 {
        return Err(SyncError::Protocol(format!(
            "expected a 4-tuple changelog entry, got {} elements",
            items.len()
        )));
    }

    let name = items[0]
        .as_str()
        .ok_or_else(|| SyncError::Protocol("changelog name was not a string".into()))?
        .to_string();
    let version = items[1].as_str().map(|s| s.to_string());
    let timestamp = items[2]
        .as_int()
        .ok_or_else(|| SyncError::Protocol("changelog timestamp was not an int".into()))?;
    let action = items[3]
        .as_str()
        .ok_or_else(|| SyncError::Protocol("changelog action was not a string".into()))?
        .to_string();

    Ok(ChangelogEntry {
        name,
        version,
        timestamp,
        action,
    })
}

fn parse_file_descriptor(value: XmlRpcValue) -> Result<FileDescriptor, SyncError> {
    let map = match value {
        XmlRpcValue::Struct(map) => map,
        other => {
            return Err(SyncError::Protocol(format!(
                "expected a file descriptor struct, got {other:?}"
            )));
        }
    };

    let get_str = |key: &str| -> String {
        map.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    Ok(FileDescriptor {
        url: get_str("url"),
        filename: get_str("filename"),
        packagetype: get_str("packagetype"),
        python_version: get_str("python_version"),
        comment_text: get_str("comment_text"),
        md5_digest: get_str("md5_digest"),
        upload_time: map
            .get("upload_time")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        size: map.get("size").and_then(|v| v.as_int()).unwrap_or(0) as u64,
        has_sig: map
            .get("has_sig")
            .map(|v| matches!(v, XmlRpcValue::Bool(true)))
            .unwrap_or(false),
    })
}

/// An XML-RPC value as parsed from a `methodResponse`, before it is
/// narrowed into the looser [`RawValue`] shape the normalizer consumes.
#[derive(Debug, Clone)]
enum XmlRpcValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Double(f64),
    Array(Vec<XmlRpcValue>),
    Struct(HashMap<String, XmlRpcValue>),
    Nil,
}

impl XmlRpcValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            XmlRpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            XmlRpcValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn into_string_list(self) -> Result<Vec<String>, SyncError> {
        match self {
            XmlRpcValue::Array(items) => items
                .into_iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        SyncError::Protocol("expected a list of strings".into())
                    })
                })
                .collect(),
            XmlRpcValue::Str(s) => Ok(vec![s]),
            other => Err(SyncError::Protocol(format!(
                "expected a list of strings, got {other:?}"
            ))),
        }
    }

    fn into_raw(self) -> RawValue {
        match self {
            XmlRpcValue::Str(s) => RawValue::Str(s),
            XmlRpcValue::Int(i) => RawValue::Int(i),
            XmlRpcValue::Bool(b) => RawValue::Bool(b),
            XmlRpcValue::Double(d) => RawValue::Str(d.to_string()),
            XmlRpcValue::Array(items) => {
                RawValue::List(items.into_iter().map(XmlRpcValue::into_raw).collect())
            }
            XmlRpcValue::Struct(map) => {
                RawValue::Map(map.into_iter().map(|(k, v)| (k, v.into_raw())).collect())
            }
            XmlRpcValue::Nil => RawValue::Null,
        }
    }
}

fn encode_call(method: &str, params: &[XmlRpcValue]) -> String {
    let mut body = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    body.push_str(&escape(method));
    body.push_str("</methodName><params>");
    for param in params {
        body.push_str("<param><value>");
        encode_value(param, &mut body);
        body.push_str("</value></param>");
    }
    body.push_str("</params></methodCall>");
    body
}

fn encode_value(value: &XmlRpcValue, out: &mut String) {
    match value {
        XmlRpcValue::Str(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s));
            out.push_str("</string>");
        }
        XmlRpcValue::Int(i) => {
            out.push_str(&format!("<int>{i}</int>"));
        }
        XmlRpcValue::Bool(b) => {
            out.push_str(&format!("<boolean>{}</boolean>", if *b { 1 } else { 0 }));
        }
        XmlRpcValue::Double(d) => {
            out.push_str(&format!("<double>{d}</double>"));
        }
        XmlRpcValue::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                out.push_str("<value>");
                encode_value(item, out);
                out.push_str("</value>");
            }
            out.push_str("</data></array>");
        }
        XmlRpcValue::Struct(map) => {
            out.push_str("<struct>");
            for (k, v) in map {
                out.push_str("<member><name>");
                out.push_str(&escape(k));
                out.push_str("</name><value>");
                encode_value(v, out);
                out.push_str("</value></member>");
            }
            out.push_str("</struct>");
        }
        XmlRpcValue::Nil => out.push_str("<nil/>"),
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Parses a `methodResponse` body into its single return value, surfacing
/// a `<fault>` as [`SyncError::Protocol`].
fn decode_response(xml: &str) -> Result<XmlRpcValue, SyncError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut saw_fault = false;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| SyncError::Protocol(format!("malformed xml-rpc response: {e}")))?
        {
            Event::Start(tag) if tag.name().as_ref() == b"fault" => {
                saw_fault = true;
            }
            Event::Start(tag) if tag.name().as_ref() == b"value" => {
                let value = parse_value(&mut reader)?;
                if saw_fault {
                    let message = match &value {
                        XmlRpcValue::Struct(map) => map
                            .get("faultString")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown fault")
                            .to_string(),
                        _ => "unknown fault".to_string(),
                    };
                    return Err(SyncError::Protocol(format!("index fault: {message}")));
                }
                return Ok(value);
            }
            Event::Eof => {
                return Err(SyncError::Protocol(
                    "xml-rpc response had no <value>".into(),
                ));
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Parses the content of a `<value>...</value>` element. Must be called
/// immediately after the `Event::Start` for `<value>` has been consumed.
fn parse_value(reader: &mut Reader<&[u8]>) -> Result<XmlRpcValue, SyncError> {
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| SyncError::Protocol(format!("malformed xml-rpc value: {e}")))?
        {
            Event::Start(tag) => {
                let name = tag.name().as_ref().to_vec();
                let value = match name.as_slice() {
                    b"string" | b"name" => XmlRpcValue::Str(read_text(reader)?),
                    b"int" | b"i4" | b"i8" => {
                        let text = read_text(reader)?;
                        XmlRpcValue::Int(text.trim().parse().map_err(|_| {
                            SyncError::Protocol(format!("invalid xml-rpc int: {text}"))
                        })?)
                    }
                    b"boolean" => {
                        let text = read_text(reader)?;
                        XmlRpcValue::Bool(text.trim() == "1")
                    }
                    b"double" => {
                        let text = read_text(reader)?;
                        XmlRpcValue::Double(text.trim().parse().map_err(|_| {
                            SyncError::Protocol(format!("invalid xml-rpc double: {text}"))
                        })?)
                    }
                    b"dateTime.iso8601" | b"base64" => XmlRpcValue::Str(read_text(reader)?),
                    b"nil" => XmlRpcValue::Nil,
                    b"array" => parse_array(reader)?,
                    b"struct" => parse_struct(reader)?,
                    other => {
                        return Err(SyncError::Protocol(format!(
                            "unsupported xml-rpc type: {}",
                            String::from_utf8_lossy(other)
                        )));
                    }
                };
                return Ok(value);
            }
            Event::Text(text) => {
                // A bare string value with no inner <string> tag, per the
                // XML-RPC spec's "implicit string" rule.
                let s = text
                    .unescape()
                    .map_err(|e| SyncError::Protocol(format!("invalid text: {e}")))?
                    .into_owned();
                if !s.trim().is_empty() {
                    return Ok(XmlRpcValue::Str(s));
                }
            }
            Event::End(tag) if tag.name().as_ref() == b"value" => {
                return Ok(XmlRpcValue::Str(String::new()));
            }
            Event::Eof => {
                return Err(SyncError::Protocol("unexpected eof in xml-rpc value".into()));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, SyncError> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| SyncError::Protocol(format!("malformed xml-rpc text: {e}")))?
        {
            Event::Text(t) => {
                text.push_str(
                    &t.unescape()
                        .map_err(|e| SyncError::Protocol(format!("invalid text: {e}")))?,
                );
            }
            Event::End(_) => return Ok(text),
            Event::Eof => {
                return Err(SyncError::Protocol("unexpected eof reading text".into()));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> Result<XmlRpcValue, SyncError> {
    let mut items = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| SyncError::Protocol(format!("malformed xml-rpc array: {e}")))?
        {
            Event::Start(tag) if tag.name().as_ref() == b"value" => {
                items.push(parse_value(reader)?);
            }
            Event::End(tag) if tag.name().as_ref() == b"array" => {
                return Ok(XmlRpcValue::Array(items));
            }
            Event::Eof => {
                return Err(SyncError::Protocol("unexpected eof in xml-rpc array".into()));
            }
            _ => {}
        }
        buf.clear();
    }
}

fn parse_struct(reader: &mut Reader<&[u8]>) -> Result<XmlRpcValue, SyncError> {
    let mut map = HashMap::new();
    let mut buf = Vec::new();
    let mut current_name: Option<String> = None;
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| SyncError::Protocol(format!("malformed xml-rpc struct: {e}")))?
        {
            Event::Start(tag) if tag.name().as_ref() == b"name" => {
                current_name = Some(read_text(reader)?);
            }
            Event::Start(tag) if tag.name().as_ref() == b"value" => {
                let value = parse_value(reader)?;
                if let Some(name) = current_name.take() {
                    map.insert(name, value);
                }
            }
            Event::End(tag) if tag.name().as_ref() == b"struct" => {
                return Ok(XmlRpcValue::Struct(map));
            }
            Event::Eof => {
                return Err(SyncError::Protocol("unexpected eof in xml-rpc struct".into()));
            }
            _ => {}
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_simple_struct_response() {
        let xml = r#"<?xml version="1.0"?>
        <methodResponse>
          <params>
            <param>
              <value>
                <struct>
                  <member><name>name</name><value><string>foo</string></value></member>
                  <member><name>count</name><value><int>3</int></value></member>
                </struct>
              </value>
            </param>
          </params>
        </methodResponse>"#;

        let value = decode_response(xml).unwrap();
        match value {
            XmlRpcValue::Struct(map) => {
                assert_eq!(map.get("name").unwrap().as_str(), Some("foo"));
                assert_eq!(map.get("count").unwrap().as_int(), Some(3));
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn decodes_an_array_of_tuples() {
        let xml = r#"<?xml version="1.0"?>
        <methodResponse>
          <params>
            <param>
              <value>
                <array>
                  <data>
                    <value><array><data>
                      <value><string>foo</string></value>
                      <value><string>1.0</string></value>
                      <value><int>10</int></value>
                      <value><string>create</string></value>
                    </data></array></value>
                  </data>
                </array>
              </value>
            </param>
          </params>
        </methodResponse>"#;

        let value = decode_response(xml).unwrap();
        let entry = match value {
            XmlRpcValue::Array(mut items) => items.remove(0),
            other => panic!("expected array, got {other:?}"),
        };
        let row = parse_changelog_row(entry).unwrap();
        assert_eq!(row.name, "foo");
        assert_eq!(row.version.as_deref(), Some("1.0"));
        assert_eq!(row.timestamp, 10);
        assert_eq!(row.action, "create");
    }

    #[test]
    fn decodes_a_fault() {
        let xml = r#"<?xml version="1.0"?>
        <methodResponse>
          <fault>
            <value>
              <struct>
                <member><name>faultCode</name><value><int>1</int></value></member>
                <member><name>faultString</name><value><string>boom</string></value></member>
              </struct>
            </value>
          </fault>
        </methodResponse>"#;

        let err = decode_response(xml).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(msg) if msg.contains("boom")));
    }

    #[test]
    fn encodes_a_call_escaping_special_characters() {
        let body = encode_call(
            "release_data",
            &[XmlRpcValue::Str("a&b<c>".to_string()), XmlRpcValue::Int(2)],
        );
        assert!(body.contains("<methodName>release_data</methodName>"));
        assert!(body.contains("a&amp;b&lt;c&gt;"));
        assert!(body.contains("<int>2</int>"));
    }

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn release_data_round_trips_through_a_mocked_server() {
        let server = MockServer::start().await;
        let body = r#"<?xml version="1.0"?>
        <methodResponse>
          <params>
            <param>
              <value>
                <struct>
                  <member><name>summary</name><value><string>hi</string></value></member>
                </struct>
              </value>
            </param>
          </params>
        </methodResponse>"#;
        Mock::given(method("POST"))
            .and(path("/pypi"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let http = RetryingClient::build(true).unwrap();
        let client = XmlRpcIndexClient::new(http, format!("{}/pypi", server.uri()));

        let release = client.release_data("foo", "1.0").await.unwrap().unwrap();
        assert_eq!(release.get_str("summary"), Some("hi"));
    }

    #[tokio::test]
    async fn a_500_response_surfaces_as_a_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pypi"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = RetryingClient::build(true).unwrap();
        let client = XmlRpcIndexClient::new(http, format!("{}/pypi", server.uri()));

        let err = client.release_data("foo", "1.0").await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_) | SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn fetch_file_downloads_and_verifies_md5() {
        let server = MockServer::start().await;
        let bytes = b"hello world";
        let md5_hex = format!("{:x}", md5::compute(bytes));
        Mock::given(method("GET"))
            .and(path("/dist/foo-1.0.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.to_vec()))
            .mount(&server)
            .await;

        let http = RetryingClient::build(true).unwrap();
        let client = XmlRpcIndexClient::new(http, format!("{}/pypi", server.uri()));

        let descriptor = FileDescriptor {
            url: format!("{}/dist/foo-1.0.tar.gz", server.uri()),
            filename: "foo-1.0.tar.gz".to_string(),
            packagetype: "sdist".to_string(),
            python_version: "source".to_string(),
            comment_text: String::new(),
            md5_digest: md5_hex,
            upload_time: None,
            size: bytes.len() as u64,
            has_sig: false,
        };

        let downloaded = client.fetch_file(&descriptor).await.unwrap();
        assert_eq!(downloaded, bytes);
    }

    #[tokio::test]
    async fn fetch_file_rejects_a_wrong_md5() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dist/foo-1.0.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let http = RetryingClient::build(true).unwrap();
        let client = XmlRpcIndexClient::new(http, format!("{}/pypi", server.uri()));

        let descriptor = FileDescriptor {
            url: format!("{}/dist/foo-1.0.tar.gz", server.uri()),
            filename: "foo-1.0.tar.gz".to_string(),
            packagetype: "sdist".to_string(),
            python_version: "source".to_string(),
            comment_text: String::new(),
            md5_digest: "deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
            upload_time: None,
            size: 11,
            has_sig: false,
        };

        let err = client.fetch_file(&descriptor).await.unwrap_err();
        assert!(matches!(err, SyncError::HashMismatch { .. }));
    }
}
