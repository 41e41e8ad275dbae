use std::pin::Pin;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, Error};
use bytes::BytesMut;
use rustyxml::{Event, Parser, StartTag};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_stream::Stream;

use crate::xml::namespaces;
use crate::xml::Element;
use crate::xmpp::jid::Jid;
use crate::xmpp::stream_header::StreamHeader;

use super::{Frame, StreamParser};

const READ_CHUNK_SIZE: usize = 4096;

fn is_stream_root(name: &str, namespace: &Option<String>) -> bool {
    name == "stream" && namespace.as_deref() == Some(namespaces::XMPP_STREAMS)
}

fn attribute<'t>(tag: &'t StartTag, name: &str) -> Option<&'t str> {
    tag.attributes
        .get(&(name.to_string(), None))
        .map(|value| value.as_str())
}

fn header_from_tag(tag: &StartTag) -> StreamHeader {
    StreamHeader {
        from: attribute(tag, "from").and_then(|jid| jid.parse::<Jid>().ok()),
        to: attribute(tag, "to").and_then(|jid| jid.parse::<Jid>().ok()),
        id: attribute(tag, "id").map(|id| id.to_string()),
        version: attribute(tag, "version").map(|version| version.to_string()),
    }
}

fn element_from_tag(tag: StartTag) -> Element {
    Element {
        name: tag.name,
        namespace: tag.ns,
        attributes: tag.attributes,
        children: Vec::new(),
    }
}

/// Streaming parser producing one [`Frame`] per stream-level event: the
/// `<stream:stream>` open and close tags, and every completed depth-one
/// element in between. Elements are assembled from the namespace-resolved
/// events of the RustyXML tokenizer.
pub struct RustyXmlStreamParser<R> {
    reader: R,
    parser: Parser,
    /// Open elements below the stream root, innermost last.
    stack: Vec<Element>,
    read_buf: Box<[u8]>,
    // bytes read but not yet fed, waiting for a complete utf-8 sequence
    pending: BytesMut,
}

impl<R: AsyncRead + Unpin + Send> RustyXmlStreamParser<R> {
    fn feed_pending(&mut self) -> Result<(), Error> {
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                self.parser.feed_str(text);
                self.pending.clear();
                Ok(())
            }
            Err(error) if error.error_len().is_none() => {
                let valid_up_to = error.valid_up_to();
                if valid_up_to > 0 {
                    // split_to keeps the incomplete tail buffered
                    let valid = self.pending.split_to(valid_up_to);
                    let text = std::str::from_utf8(&valid).expect("validated prefix");
                    self.parser.feed_str(text);
                }
                Ok(())
            }
            Err(error) => Err(anyhow!(error)),
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<Option<Frame>, Error> {
        match event {
            Event::ElementStart(tag) => {
                if self.stack.is_empty() && is_stream_root(&tag.name, &tag.ns) {
                    return Ok(Some(Frame::StreamStart(header_from_tag(&tag))));
                }
                self.stack.push(element_from_tag(tag));
                Ok(None)
            }
            Event::ElementEnd(tag) => {
                let Some(element) = self.stack.pop() else {
                    if is_stream_root(&tag.name, &tag.ns) {
                        return Ok(Some(Frame::StreamEnd));
                    }
                    return Err(anyhow!("unbalanced end tag </{}>", tag.name));
                };
                match self.stack.last_mut() {
                    Some(parent) => {
                        parent.add_child(element);
                        Ok(None)
                    }
                    None => Ok(Some(Frame::XmlFragment(element))),
                }
            }
            Event::Characters(text) | Event::CDATA(text) => {
                if let Some(open) = self.stack.last_mut() {
                    open.add_text(text);
                }
                Ok(None)
            }
            Event::Comment(_) | Event::PI(_) => Ok(None),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> Stream for RustyXmlStreamParser<R> {
    type Item = Result<Frame, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            while let Some(parser_result) = this.parser.next() {
                let event = match parser_result {
                    Ok(event) => event,
                    Err(error) => return Poll::Ready(Some(Err(anyhow!(error)))),
                };

                match this.handle_event(event) {
                    Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                    Ok(None) => {}
                    Err(error) => return Poll::Ready(Some(Err(error))),
                }
            }

            let mut buf = ReadBuf::new(&mut this.read_buf[..]);
            ready!(Pin::new(&mut this.reader).poll_read(cx, &mut buf))?;

            if buf.filled().is_empty() {
                return Poll::Ready(None);
            }

            this.pending.extend_from_slice(buf.filled());
            if let Err(error) = this.feed_pending() {
                return Poll::Ready(Some(Err(error)));
            }
        }
    }
}

impl<R: AsyncRead + Unpin + Send> StreamParser<R> for RustyXmlStreamParser<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Parser::new(),
            stack: Vec::new(),
            read_buf: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            pending: BytesMut::new(),
        }
    }

    fn into_inner(self) -> R {
        self.reader
    }
}
