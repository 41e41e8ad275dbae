use std::collections::HashMap;

use anyhow::{anyhow, Error};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::xml::namespaces;
use crate::xml::Element;
use crate::xml::Node;
use crate::xmpp::stream_header::StreamHeader;

fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Serializes elements onto one direction of an XMPP stream. Namespace
/// declarations made by the stream header stay on the prefix stack for the
/// lifetime of the writer, so `stream:` and `db:` prefixed elements written
/// later resolve without redeclaring.
pub struct StreamWriter<W: AsyncWrite + Unpin> {
    writer: W,
    namespaces: Vec<HashMap<String, String>>, // stacked namespace to prefix map
    header_written: bool,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(namespaces::XML.to_string(), "xml".to_string());
        namespaces.insert(namespaces::XMLNS.to_string(), "xmlns".to_string());
        let namespaces = vec![namespaces];

        Self {
            writer,
            namespaces,
            header_written: false,
        }
    }

    /// Whether this writer has opened a stream. Prefixed frames may only be
    /// written afterwards; close paths consult this before emitting the
    /// closing tag.
    pub fn has_stream_header(&self) -> bool {
        self.header_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub async fn write_stream_header(
        &mut self,
        header: &StreamHeader,
        include_xml_declaration: bool,
    ) -> Result<(), Error> {
        if include_xml_declaration {
            self.write_xml_declaration().await?;
        }

        let mut attributes = HashMap::new();
        if let Some(from) = &header.from {
            attributes.insert(("from".to_string(), None), from.to_string());
        }
        if let Some(to) = &header.to {
            attributes.insert(("to".to_string(), None), to.to_string());
        }
        if let Some(id) = &header.id {
            attributes.insert(("id".to_string(), None), id.to_string());
        }
        attributes.insert(
            ("version".to_string(), None),
            header.version.clone().unwrap_or_else(|| "1.0".to_string()),
        );
        attributes.insert(
            ("xmlns".to_string(), None),
            namespaces::XMPP_SERVER.to_string(),
        );
        attributes.insert(
            ("stream".to_string(), Some(namespaces::XMLNS.to_string())),
            namespaces::XMPP_STREAMS.to_string(),
        );
        attributes.insert(
            ("db".to_string(), Some(namespaces::XMLNS.to_string())),
            namespaces::DIALBACK.to_string(),
        );

        let stream_element = Element {
            name: "stream".to_string(),
            namespace: Some(namespaces::XMPP_STREAMS.to_string()),
            attributes,
            children: vec![],
        };

        let opening_tag = self.build_opening_tag(&stream_element, false);
        self.header_written = true;
        self.write_str(&opening_tag).await
    }

    pub async fn write_stream_close(&mut self) -> Result<(), Error> {
        let stream_element = Element {
            name: "stream".to_string(),
            namespace: Some(namespaces::XMPP_STREAMS.to_string()),
            attributes: HashMap::new(),
            children: vec![],
        };

        let closing_tag = self.build_closing_tag(&stream_element);
        self.write_str(&closing_tag).await
    }

    pub async fn write_xml_element(&mut self, element: &Element) -> Result<(), Error> {
        let xml = self.build_xml_element(element);
        self.write_str(&xml).await
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.writer.shutdown().await.map_err(|err| anyhow!(err))
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|err| anyhow!(err))?;

        self.writer.flush().await.map_err(|err| anyhow!(err))
    }

    async fn write_str(&mut self, string: &str) -> Result<(), Error> {
        tracing::trace!(frame = string, "writing stream frame");
        self.write_bytes(string.as_bytes()).await
    }

    async fn write_xml_declaration(&mut self) -> Result<(), Error> {
        self.write_str("<?xml version='1.0'?>").await
    }

    fn lookup_namespace_prefix(&self, namespace: &str) -> Option<&str> {
        for namespaces in self.namespaces.iter().rev() {
            if let Some(prefix) = namespaces.get(namespace) {
                return Some(prefix);
            }
        }

        None
    }

    fn build_xml_element(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        if !element.children.is_empty() {
            xml.push_str(&self.build_opening_tag(element, false));
            xml.push_str(&self.build_children(element));
            xml.push_str(&self.build_closing_tag(element));
        } else {
            xml.push_str(&self.build_opening_tag(element, true));
        }

        xml
    }

    fn build_opening_tag(&mut self, element: &Element, self_closing: bool) -> String {
        let mut xml = String::new();

        // Collect namespace declarations carried by this element's attributes
        let mut namespaces = HashMap::new();
        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) => {
                    if namespace == namespaces::XMLNS {
                        namespaces.insert(value.clone(), attribute.clone()); // prefixed namespace
                    }
                }
                None => {
                    if attribute == "xmlns" {
                        namespaces.insert(value.clone(), String::new()); // default namespace
                    }
                }
            }
        }
        self.namespaces.push(namespaces);

        match &element.namespace {
            Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                Some("") => {
                    xml.push_str(&format!(
                        "<{}{}",
                        element.name,
                        self.build_attributes(element)
                    ));
                }
                Some(prefix) => {
                    xml.push_str(&format!(
                        "<{}:{}{}",
                        prefix,
                        element.name,
                        self.build_attributes(element)
                    ));
                }
                None => {
                    debug_assert!(false, "namespace not declared");
                }
            },
            None => {
                xml.push_str(&format!(
                    "<{}{}",
                    element.name,
                    self.build_attributes(element)
                ));
            }
        }

        if self_closing {
            self.namespaces.pop();

            xml.push_str("/>");
        } else {
            xml.push('>');
        }

        xml
    }

    fn build_attributes(&self, element: &Element) -> String {
        let mut xml = String::new();

        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                    Some("") => {
                        debug_assert!(false, "cannot use default namespace for attribute");
                    }
                    Some(prefix) => {
                        xml.push_str(&format!(
                            r#" {}:{}="{}""#,
                            prefix,
                            attribute,
                            escape_attribute(value),
                        ));
                    }
                    None => {
                        debug_assert!(false, "namespace not declared");
                    }
                },
                None => {
                    xml.push_str(&format!(r#" {}="{}""#, attribute, escape_attribute(value)));
                }
            }
        }

        xml
    }

    fn build_children(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        for child in &element.children {
            match child {
                Node::Element(child_element) => {
                    xml.push_str(&self.build_xml_element(child_element));
                }
                Node::Text(text) => {
                    xml.push_str(&escape_text(text));
                }
                Node::CData(cdata) => {
                    xml.push_str(&format!("<![CDATA[{}]]>", cdata));
                }
                Node::Comment(comment) => {
                    xml.push_str(&format!("<!--{}-->", comment));
                }
                Node::ProcessingInstruction(pi) => {
                    xml.push_str(&format!("<?{}?>", pi));
                }
            }
        }

        xml
    }

    fn build_closing_tag(&mut self, element: &Element) -> String {
        let mut xml = String::new();

        match &element.namespace {
            Some(namespace) => match self.lookup_namespace_prefix(namespace) {
                Some("") => {
                    xml.push_str(&format!("</{}>", element.name));
                }
                Some(prefix) => {
                    xml.push_str(&format!("</{}:{}>", prefix, element.name));
                }
                None => {
                    debug_assert!(false, "namespace not declared");
                }
            },
            None => {
                xml.push_str(&format!("</{}>", element.name));
            }
        }

        self.namespaces.pop();

        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_element_after_header(element: &Element) -> String {
        let mut output = Vec::new();
        let mut writer = StreamWriter::new(&mut output);
        let header = StreamHeader {
            from: Some("local.example".parse().unwrap()),
            to: None,
            id: Some("sid".to_string()),
            version: None,
        };
        writer.write_stream_header(&header, false).await.unwrap();
        writer.write_xml_element(element).await.unwrap();
        let written = String::from_utf8(output).unwrap();
        let header_end = written.find('>').unwrap();
        written[header_end + 1..].to_string()
    }

    #[tokio::test]
    async fn header_carries_stream_and_dialback_declarations() {
        let mut output = Vec::new();
        let mut writer = StreamWriter::new(&mut output);
        let header = StreamHeader {
            from: Some("local.example".parse().unwrap()),
            to: Some("remote.example".parse().unwrap()),
            id: Some("abc".to_string()),
            version: None,
        };
        writer.write_stream_header(&header, true).await.unwrap();

        let written = String::from_utf8(output).unwrap();
        assert!(written.starts_with("<?xml version='1.0'?>"));
        assert!(written.contains("<stream:stream"));
        assert!(written.contains(r#"xmlns="jabber:server""#));
        assert!(written.contains(r#"xmlns:stream="http://etherx.jabber.org/streams""#));
        assert!(written.contains(r#"xmlns:db="jabber:server:dialback""#));
        assert!(written.contains(r#"from="local.example""#));
        assert!(written.contains(r#"to="remote.example""#));
        assert!(written.contains(r#"id="abc""#));
        assert!(written.contains(r#"version="1.0""#));
        assert!(!written.contains("</stream:stream>"));
    }

    #[tokio::test]
    async fn stream_prefix_resolves_after_header() {
        let element = Element::new("features", Some(namespaces::XMPP_STREAMS));
        let serialized = write_element_after_header(&element).await;
        assert_eq!(serialized, "<stream:features/>");
    }

    #[tokio::test]
    async fn dialback_prefix_resolves_after_header() {
        let mut element = Element::new("result", Some(namespaces::DIALBACK));
        element.add_text("deadbeef".to_string());
        let serialized = write_element_after_header(&element).await;
        assert!(serialized.starts_with("<db:result"));
        assert!(serialized.ends_with(">deadbeef</db:result>"));
    }

    #[tokio::test]
    async fn text_is_escaped() {
        let mut element = Element::new("message", Some(namespaces::XMPP_SERVER));
        element.add_text("a < b & c".to_string());
        let serialized = write_element_after_header(&element).await;
        assert!(serialized.contains("a &lt; b &amp; c"));
    }

    #[tokio::test]
    async fn stream_close_tag() {
        let mut output = Vec::new();
        let mut writer = StreamWriter::new(&mut output);
        let header = StreamHeader {
            from: Some("local.example".parse().unwrap()),
            to: None,
            id: None,
            version: None,
        };
        writer.write_stream_header(&header, false).await.unwrap();
        writer.write_stream_close().await.unwrap();
        let written = String::from_utf8(output).unwrap();
        assert!(written.ends_with("</stream:stream>"));
    }
}
