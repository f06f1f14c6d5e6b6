//! Response-phase rewriting: inject the `<noscript>` fallback right after
//! the opening `<body>` tag and the protective script reference right before
//! `</body>`, without buffering the streamed body.
//!
//! Only the minimal lookback is held across chunk boundaries: a possible
//! split tag prefix, or an opening body tag whose `>` has not arrived yet.
//! If the markers never show up the body passes through untouched.

use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::Full;
use pin_project_lite::pin_project;

use crate::config::Config;

const BODY_OPEN: &[u8] = b"<body";
const BODY_CLOSE: &[u8] = b"</body";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Scanning for `<body`.
    SeekOpen,
    /// Inside the opening tag, scanning for its `>`.
    InOpenTag,
    /// Scanning for `</body`.
    SeekClose,
    /// Both insertions done (or given up), pass everything through.
    Done,
}

/// Incremental tag scanner. Feed it chunks with [`transform`], flush with
/// [`finish`] once the stream ends.
///
/// [`transform`]: Injector::transform
/// [`finish`]: Injector::finish
pub(crate) struct Injector {
    phase: Phase,
    carry: Vec<u8>,
    noscript: Vec<u8>,
    script: Vec<u8>,
}

impl Injector {
    pub(crate) fn new(config: &Config) -> Self {
        let noscript = if config.noscript_message.is_empty() {
            Vec::new()
        } else {
            format!("<noscript>{}</noscript>", config.noscript_message).into_bytes()
        };
        let script = if config.js_asset_uri.is_empty() {
            Vec::new()
        } else {
            format!(
                "<script type=\"text/javascript\" src=\"{}\"></script>",
                config.js_asset_uri
            )
            .into_bytes()
        };

        Self {
            phase: Phase::SeekOpen,
            carry: Vec::new(),
            noscript,
            script,
        }
    }

    /// True when there is nothing to inject, so wrapping the body would be
    /// pointless.
    pub(crate) fn is_noop(&self) -> bool {
        self.noscript.is_empty() && self.script.is_empty()
    }

    /// Processes one chunk, returning the bytes that are safe to emit.
    pub(crate) fn transform(&mut self, chunk: &[u8]) -> Bytes {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(buf.len());
        let mut pos = 0;

        loop {
            match self.phase {
                Phase::SeekOpen => match find_tag(&buf[pos..], BODY_OPEN) {
                    TagSearch::Found(offset) => {
                        let end = pos + offset + BODY_OPEN.len();
                        out.extend_from_slice(&buf[pos..end]);
                        pos = end;
                        self.phase = Phase::InOpenTag;
                    }
                    TagSearch::Partial(offset) => {
                        let start = pos + offset;
                        out.extend_from_slice(&buf[pos..start]);
                        self.carry = buf[start..].to_vec();
                        break;
                    }
                    TagSearch::NotFound => {
                        out.extend_from_slice(&buf[pos..]);
                        break;
                    }
                },
                Phase::InOpenTag => match buf[pos..].iter().position(|&b| b == b'>') {
                    Some(offset) => {
                        let end = pos + offset + 1;
                        out.extend_from_slice(&buf[pos..end]);
                        out.extend_from_slice(&self.noscript);
                        pos = end;
                        self.phase = Phase::SeekClose;
                    }
                    None => {
                        // Tag still open; hold it back until its `>` arrives.
                        self.carry = buf[pos..].to_vec();
                        break;
                    }
                },
                Phase::SeekClose => match find_tag(&buf[pos..], BODY_CLOSE) {
                    TagSearch::Found(offset) => {
                        let at = pos + offset;
                        out.extend_from_slice(&buf[pos..at]);
                        out.extend_from_slice(&self.script);
                        out.extend_from_slice(&buf[at..]);
                        self.phase = Phase::Done;
                        break;
                    }
                    TagSearch::Partial(offset) => {
                        let start = pos + offset;
                        out.extend_from_slice(&buf[pos..start]);
                        self.carry = buf[start..].to_vec();
                        break;
                    }
                    TagSearch::NotFound => {
                        out.extend_from_slice(&buf[pos..]);
                        break;
                    }
                },
                Phase::Done => {
                    out.extend_from_slice(&buf[pos..]);
                    break;
                }
            }
        }

        Bytes::from(out)
    }

    /// Flushes any held-back bytes at end of stream. When the markers were
    /// never found the body degrades to an unmodified pass-through.
    pub(crate) fn finish(&mut self) -> Bytes {
        if self.phase != Phase::Done {
            tracing::debug!(phase = ?self.phase, "body markers not found, response left unmodified");
        }
        self.phase = Phase::Done;

        Bytes::from(std::mem::take(&mut self.carry))
    }
}

enum TagSearch {
    /// Complete tag match at this offset.
    Found(usize),
    /// The buffer ends in what could still become a match; offset of the
    /// possible start.
    Partial(usize),
    /// Nothing, emit everything.
    NotFound,
}

/// ASCII-case-insensitive scan for `needle` followed by a tag delimiter, so
/// `<body>` and `<BODY class=..>` match but `<bodyguard>` does not.
fn find_tag(hay: &[u8], needle: &[u8]) -> TagSearch {
    let mut start = 0;
    while start + needle.len() <= hay.len() {
        if hay[start..start + needle.len()].eq_ignore_ascii_case(needle) {
            match hay.get(start + needle.len()) {
                // `<body1>` would be a different element.
                Some(next) if next.is_ascii_alphanumeric() => {
                    start += needle.len();
                    continue;
                }
                Some(_) => return TagSearch::Found(start),
                // Delimiter not seen yet; decide next chunk.
                None => return TagSearch::Partial(start),
            }
        }
        start += 1;
    }

    // A suffix of the buffer may be a prefix of the needle split across
    // chunks.
    let max = needle.len().min(hay.len());
    for keep in (1..=max).rev() {
        if hay[hay.len() - keep..].eq_ignore_ascii_case(&needle[..keep]) {
            return TagSearch::Partial(hay.len() - keep);
        }
    }

    TagSearch::NotFound
}

pin_project! {
    /// Response body leaving the middleware: the inner stream with markup
    /// injection, an untouched pass-through, or a synthetic rejection body.
    #[project = CsrfBodyProj]
    pub enum CsrfBody<B> {
        Passthrough {
            #[pin]
            inner: B,
        },
        Rewrite {
            #[pin]
            inner: B,
            injector: Injector,
            finished: bool,
            pending: Option<Frame<Bytes>>,
        },
        Synthetic {
            #[pin]
            inner: Full<Bytes>,
        },
    }
}

impl<B> CsrfBody<B> {
    pub(crate) fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    pub(crate) fn rewrite(inner: B, injector: Injector) -> Self {
        Self::Rewrite {
            inner,
            injector,
            finished: false,
            pending: None,
        }
    }
}

impl<B> From<Bytes> for CsrfBody<B> {
    fn from(bytes: Bytes) -> Self {
        Self::Synthetic {
            inner: Full::new(bytes),
        }
    }
}

impl<B> Body for CsrfBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            CsrfBodyProj::Passthrough { inner } => inner.poll_frame(cx),
            CsrfBodyProj::Synthetic { inner } => inner
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(|never| match never {}))),
            CsrfBodyProj::Rewrite {
                mut inner,
                injector,
                finished,
                pending,
            } => loop {
                if let Some(frame) = pending.take() {
                    return Poll::Ready(Some(Ok(frame)));
                }
                if *finished {
                    return Poll::Ready(None);
                }

                match ready!(inner.as_mut().poll_frame(cx)) {
                    None => {
                        *finished = true;
                        let tail = injector.finish();
                        if tail.is_empty() {
                            return Poll::Ready(None);
                        }
                        return Poll::Ready(Some(Ok(Frame::data(tail))));
                    }
                    Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => {
                            let out = injector.transform(&data);
                            if !out.is_empty() {
                                return Poll::Ready(Some(Ok(Frame::data(out))));
                            }
                            // Everything held back; poll for more input.
                        }
                        Err(frame) => {
                            // Trailers end the data stream. Flush the held
                            // bytes first to keep frame order intact.
                            *finished = true;
                            let tail = injector.finish();
                            if tail.is_empty() {
                                return Poll::Ready(Some(Ok(frame)));
                            }
                            *pending = Some(frame);
                            return Poll::Ready(Some(Ok(Frame::data(tail))));
                        }
                    },
                }
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Passthrough { inner } => inner.is_end_stream(),
            Self::Synthetic { inner } => inner.is_end_stream(),
            Self::Rewrite {
                finished, pending, ..
            } => *finished && pending.is_none(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Passthrough { inner } => inner.size_hint(),
            Self::Synthetic { inner } => inner.size_hint(),
            // Injection changes the length in ways we can't predict here.
            Self::Rewrite { .. } => SizeHint::default(),
        }
    }
}
