//! Single-pass structural HTML reader.
//!
//! Walks the html5ever token stream with an explicit frame stack and emits one [`Snippet`]
//! per block-like element holding its visible text and the element's path. Offsets are byte
//! positions in the token stream (unescaped text length plus canonical tag length).

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{
    BufferQueue, Doctype, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer,
    TokenizerOpts, TokenizerResult,
};
use nerpipe_core::{Error, Result, Snippet};
use std::collections::VecDeque;
use std::io::Read;

const READ_CHUNK: usize = 8 * 1024;

/// Elements whose text content is never visible.
const DISALLOWED: &[&str] = &[
    "area", "audio", "head", "link", "meta", "noscript", "script", "source", "style", "input",
    "textarea", "video",
];

/// Inline elements whose text flows into the enclosing block.
const NON_BREAKING: &[&str] = &[
    "span", "sub", "sup", "b", "del", "i", "ins", "mark", "q", "s", "strike", "strong", "u",
    "big", "small", "a", "emph",
];

/// Elements that never have content, with or without a trailing `/`.
const VOID: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementClass {
    Disallowed,
    NonBreaking,
    Block,
}

fn classify(tag: &str) -> ElementClass {
    if DISALLOWED.contains(&tag) {
        ElementClass::Disallowed
    } else if NON_BREAKING.contains(&tag) {
        ElementClass::NonBreaking
    } else {
        ElementClass::Block
    }
}

fn is_blank(b: u8) -> bool {
    b <= 0x20
}

fn tag_len(tag: &Tag) -> usize {
    let mut n = 2 + tag.name.len();
    if tag.kind == TagKind::EndTag {
        n += 1;
    }
    for attr in &tag.attrs {
        n += 1 + attr.name.local.len();
        if !attr.value.is_empty() {
            n += 3 + attr.value.len();
        }
    }
    if tag.self_closing {
        n += 1;
    }
    n
}

fn doctype_len(doctype: &Doctype) -> usize {
    let mut n = "<!DOCTYPE>".len();
    if let Some(name) = &doctype.name {
        n += 1 + name.len();
    }
    if let Some(public_id) = &doctype.public_id {
        n += " PUBLIC \"\"".len() + public_id.len();
    }
    if let Some(system_id) = &doctype.system_id {
        n += " \"\"".len() + system_id.len();
    }
    n
}

#[derive(Debug)]
struct Frame {
    tag: String,
    class: ElementClass,
    start_offset: usize,
    children: usize,
    path: String,
    buffer: String,
    /// Position of the first byte appended since the last flush.
    anchor: Option<usize>,
    /// Position of the first non-blank byte appended since the last flush.
    content: Option<usize>,
}

impl Frame {
    /// Implicit block around the whole document, catching text outside any block element.
    fn root() -> Self {
        Self {
            tag: String::new(),
            class: ElementClass::Block,
            start_offset: 0,
            children: 0,
            path: "/".to_string(),
            buffer: String::new(),
            anchor: None,
            content: None,
        }
    }

    fn is_root(&self) -> bool {
        self.tag.is_empty()
    }

    fn append(&mut self, text: &str, position: usize) {
        if text.is_empty() {
            return;
        }
        self.anchor.get_or_insert(position);
        if self.content.is_none() {
            if let Some(i) = text.bytes().position(|b| !is_blank(b)) {
                self.content = Some(position + i);
            }
        }
        self.buffer.push_str(text);
    }

    fn take_snippet(&mut self) -> Option<Snippet> {
        if self.buffer.is_empty() {
            return None;
        }
        // Whitespace between top-level elements is not a snippet.
        if self.is_root() && self.content.is_none() {
            self.buffer.clear();
            self.anchor = None;
            return None;
        }
        let mut text = std::mem::take(&mut self.buffer);
        text.push('\n');
        let offset = self
            .content
            .take()
            .or(self.anchor.take())
            .unwrap_or(self.start_offset);
        self.anchor = None;
        Some(Snippet::new(text, offset, self.path.clone()))
    }
}

/// Token sink holding the frame stack.
#[derive(Debug)]
struct FrameSink {
    stack: Vec<Frame>,
    root: Frame,
    position: usize,
    /// Stack depth of the outermost open disallowed element.
    disallowed_depth: Option<usize>,
    ready: VecDeque<Snippet>,
}

impl Default for FrameSink {
    fn default() -> Self {
        Self {
            stack: Vec::new(),
            root: Frame::root(),
            position: 0,
            disallowed_depth: None,
            ready: VecDeque::new(),
        }
    }
}

impl FrameSink {
    /// The innermost open block, or the document root when no block is open.
    fn sink_frame(&mut self) -> Option<&mut Frame> {
        if self.disallowed_depth.is_some() {
            return None;
        }
        let Self { stack, root, .. } = self;
        Some(
            stack
                .iter_mut()
                .rev()
                .find(|f| f.class == ElementClass::Block)
                .unwrap_or(root),
        )
    }

    fn line_break(&mut self) {
        let position = self.position;
        if let Some(frame) = self.sink_frame() {
            frame.append("\n", position);
        }
    }

    fn text(&mut self, text: &str) {
        let position = self.position;
        if let Some(frame) = self.sink_frame() {
            frame.append(text, position);
        }
        self.position += text.len();
    }

    fn start_tag(&mut self, tag: &Tag) -> TokenSinkResult<()> {
        self.position += tag_len(tag);
        let name: &str = &tag.name;

        if let Some(parent) = self.stack.last_mut() {
            parent.children += 1;
        }

        if name == "br" {
            self.line_break();
            return TokenSinkResult::Continue;
        }
        if tag.self_closing || VOID.contains(&name) {
            return TokenSinkResult::Continue;
        }

        let class = classify(name);
        if class == ElementClass::Block {
            // Text before a nested block is flushed so snippet offsets stay in document order.
            if let Some(snippet) = self.sink_frame().and_then(Frame::take_snippet) {
                self.ready.push_back(snippet);
            }
        }

        let path = match self.stack.last() {
            Some(parent) => format!("{}/*[{}]", parent.path, parent.children),
            None => format!("/{name}"),
        };
        self.stack.push(Frame {
            tag: name.to_string(),
            class,
            start_offset: self.position,
            children: 0,
            path,
            buffer: String::new(),
            anchor: None,
            content: None,
        });
        if class == ElementClass::Disallowed && self.disallowed_depth.is_none() {
            self.disallowed_depth = Some(self.stack.len());
        }

        match name {
            "script" => TokenSinkResult::RawData(RawKind::ScriptData),
            "style" | "xmp" | "iframe" | "noembed" | "noframes" | "noscript" => {
                TokenSinkResult::RawData(RawKind::Rawtext)
            }
            "textarea" | "title" => TokenSinkResult::RawData(RawKind::Rcdata),
            "plaintext" => TokenSinkResult::Plaintext,
            _ => TokenSinkResult::Continue,
        }
    }

    fn end_tag(&mut self, tag: &Tag) {
        self.position += tag_len(tag);
        let name: &str = &tag.name;
        if name == "br" {
            // Browsers read `</br>` as `<br>`.
            self.line_break();
            return;
        }
        let Some(index) = self.stack.iter().rposition(|f| f.tag == name) else {
            tracing::trace!(tag = name, "ignoring stray end tag");
            return;
        };
        while self.stack.len() > index {
            self.pop_frame();
        }
    }

    fn pop_frame(&mut self) {
        let depth = self.stack.len();
        let Some(mut frame) = self.stack.pop() else {
            return;
        };
        if self.disallowed_depth == Some(depth) {
            self.disallowed_depth = None;
        }
        if frame.class == ElementClass::Block {
            if let Some(snippet) = frame.take_snippet() {
                self.ready.push_back(snippet);
            }
        }
    }
}

impl TokenSink for FrameSink {
    type Handle = ();

    fn process_token(&mut self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        match token {
            Token::CharacterTokens(text) => self.text(&text),
            Token::NullCharacterToken => self.position += 1,
            Token::TagToken(tag) => match tag.kind {
                TagKind::StartTag => return self.start_tag(&tag),
                TagKind::EndTag => self.end_tag(&tag),
            },
            Token::CommentToken(comment) => self.position += "<!---->".len() + comment.len(),
            Token::DoctypeToken(doctype) => self.position += doctype_len(&doctype),
            Token::ParseError(msg) => tracing::debug!(error = %msg, "recoverable html parse error"),
            Token::EOFToken => {
                while !self.stack.is_empty() {
                    self.pop_frame();
                }
                if let Some(snippet) = self.root.take_snippet() {
                    self.ready.push_back(snippet);
                }
            }
        }
        TokenSinkResult::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Reading,
    Done,
}

/// Lazily reads snippets from an HTML byte stream.
///
/// Yields `Ok(snippet)` in document order and at most one `Err`, after which iteration stops.
pub struct SnippetReader<R> {
    input: R,
    tokenizer: Tokenizer<FrameSink>,
    queue: BufferQueue,
    chunk: Vec<u8>,
    /// Trailing bytes of an incomplete UTF-8 sequence from the previous read.
    carry: Vec<u8>,
    failed: Option<Error>,
    state: ReaderState,
}

impl<R: Read> SnippetReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            tokenizer: Tokenizer::new(FrameSink::default(), TokenizerOpts::default()),
            queue: BufferQueue::default(),
            chunk: vec![0; READ_CHUNK],
            carry: Vec::new(),
            failed: None,
            state: ReaderState::Reading,
        }
    }

    /// Read and tokenise one more chunk. Returns false at end of input.
    fn fill(&mut self) -> Result<bool> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        let n = loop {
            match self.input.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::InputRead(e.to_string())),
            }
        };
        if n == 0 {
            if !self.carry.is_empty() {
                return Err(Error::Parse("input ends inside a utf-8 sequence".to_string()));
            }
            return Ok(false);
        }

        self.carry.extend_from_slice(&self.chunk[..n]);
        let text = match std::str::from_utf8(&self.carry) {
            Ok(text) => {
                let text = StrTendril::from_slice(text);
                self.carry.clear();
                text
            }
            Err(e) if e.error_len().is_some() => {
                // Tokenise what decoded cleanly; the error surfaces on the next read.
                let valid = e.valid_up_to();
                self.failed = Some(Error::Parse(format!("invalid utf-8: {e}")));
                let text = std::str::from_utf8(&self.carry[..valid])
                    .map(StrTendril::from_slice)
                    .map_err(|e| Error::Parse(e.to_string()))?;
                self.carry.clear();
                text
            }
            Err(e) => {
                let valid = e.valid_up_to();
                let text = std::str::from_utf8(&self.carry[..valid])
                    .map(StrTendril::from_slice)
                    .map_err(|e| Error::Parse(e.to_string()))?;
                self.carry.drain(..valid);
                text
            }
        };
        if !text.is_empty() {
            self.queue.push_back(text);
            let result = self.tokenizer.feed(&mut self.queue);
            // Script suspension only happens when the sink asks for it, and this one never does.
            debug_assert!(matches!(result, TokenizerResult::Done));
        }
        Ok(true)
    }
}

impl<R: Read> Iterator for SnippetReader<R> {
    type Item = Result<Snippet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(snippet) = self.tokenizer.sink.ready.pop_front() {
                return Some(Ok(snippet));
            }
            if self.state == ReaderState::Done {
                return None;
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.tokenizer.end();
                    self.state = ReaderState::Done;
                }
                Err(e) => {
                    self.state = ReaderState::Done;
                    self.tokenizer.sink.ready.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Read every snippet of an in-memory document.
pub fn read_snippets(html: &str) -> Result<Vec<Snippet>> {
    SnippetReader::new(html.as_bytes()).collect()
}

/// Visible text of a document: the concatenation of its snippets.
pub fn visible_text(snippets: &[Snippet]) -> String {
    snippets.iter().map(|s| s.text.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn one(html: &str) -> Snippet {
        let mut got = read_snippets(html).unwrap();
        assert_eq!(got.len(), 1, "expected exactly one snippet, got {got:?}");
        got.remove(0)
    }

    #[test]
    fn strips_inline_tags_and_breaks_lines() {
        let s = one("<body>  x<sup>2</sup> <strike>hello</strike><br/>dave</body>");
        assert_eq!(s, Snippet::new("  x2 hello\ndave\n", 8, "/body"));
    }

    #[test]
    fn inline_emph_joins_into_the_paragraph() {
        let s = one("<p>acetyl<emph>car</emph>nitine</p>");
        assert_eq!(s, Snippet::new("acetylcarnitine\n", 3, "/p"));
    }

    #[test]
    fn xpath_uses_sibling_positions() {
        let got =
            read_snippets("<html><div>nonsense</div><div><span>calcium</span></div></html>")
                .unwrap();
        let pairs: Vec<_> = got.iter().map(|s| (s.text.as_str(), s.xpath.as_str())).collect();
        assert_eq!(
            pairs,
            vec![("nonsense\n", "/html/*[1]"), ("calcium\n", "/html/*[2]")]
        );
    }

    #[test]
    fn disallowed_subtrees_are_dropped_but_still_advance_offsets() {
        let got = read_snippets(
            "<html><head><title>t</title><style>p{}</style></head><body><script>if (a<b) x()</script><p>ok</p><video><p>no</p></video></body></html>",
        )
        .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "ok\n");
        assert_eq!(got[0].xpath, "/html/*[2]/*[2]");
        let html = "<html><head><title>t</title><style>p{}</style></head><body><script>if (a<b) x()</script><p>";
        assert_eq!(got[0].offset, html.len());
    }

    #[test]
    fn void_elements_do_not_open_frames() {
        let got = read_snippets("<div><img src=\"a.png\"><p>one<br>two</p><hr><p>three</p></div>").unwrap();
        let pairs: Vec<_> = got.iter().map(|s| (s.text.as_str(), s.xpath.as_str())).collect();
        assert_eq!(
            pairs,
            vec![("one\ntwo\n", "/div/*[2]"), ("three\n", "/div/*[4]")]
        );
    }

    #[test]
    fn unclosed_and_misnested_tags_are_tolerated() {
        let got = read_snippets("<div><p>alpha<b>beta</p></i>gamma").unwrap();
        let texts: Vec<_> = got.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["alphabeta\n", "gamma\n"]);
        assert_eq!(got[1].xpath, "/div");
    }

    #[test]
    fn text_before_a_nested_block_is_emitted_first() {
        let got = read_snippets("<div>lead<p>inner</p>tail</div>").unwrap();
        let pairs: Vec<_> = got.iter().map(|s| (s.text.as_str(), s.offset)).collect();
        assert_eq!(
            pairs,
            vec![("lead\n", 5), ("inner\n", 12), ("tail\n", 21)]
        );
    }

    #[test]
    fn text_outside_any_block_belongs_to_the_root() {
        let got = read_snippets("<span>calcium</span>").unwrap();
        assert_eq!(got, vec![Snippet::new("calcium\n", 6, "/")]);

        let got = read_snippets("calcium chloride").unwrap();
        assert_eq!(got, vec![Snippet::new("calcium chloride\n", 0, "/")]);

        let got = read_snippets("<b>aspirin</b> and <i>water</i>").unwrap();
        assert_eq!(got, vec![Snippet::new("aspirin and water\n", 3, "/")]);
    }

    #[test]
    fn root_text_is_flushed_when_a_block_opens() {
        let got = read_snippets("lead<p>inner</p>\n").unwrap();
        let got: Vec<_> = got
            .iter()
            .map(|s| (s.text.as_str(), s.offset, s.xpath.as_str()))
            .collect();
        assert_eq!(got, vec![("lead\n", 0, "/"), ("inner\n", 7, "/p")]);
    }

    #[test]
    fn stray_br_end_tag_breaks_the_line() {
        let got = read_snippets("<p>one</br>two</p>").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "one\ntwo\n");
    }

    #[test]
    fn entities_are_unescaped_and_counted_unescaped() {
        let got = read_snippets("<p>a &amp; b</p><p>c</p>").unwrap();
        assert_eq!(got[0].text, "a & b\n");
        // "<p>" + "a & b" + "</p>" + "<p>"
        assert_eq!(got[1].offset, 3 + 5 + 4 + 3);
    }

    #[test]
    fn visible_text_concatenates_snippets() {
        let got = read_snippets("<div><p>one</p><p>two</p></div>").unwrap();
        assert_eq!(visible_text(&got), "one\ntwo\n");
    }

    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn multibyte_text_split_across_reads() {
        let html = "<p>naïve β-alanine £5</p>";
        let got: Vec<_> = SnippetReader::new(Trickle(html.as_bytes()))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(got, read_snippets(html).unwrap());
        assert_eq!(got[0].text, "naïve β-alanine £5\n");
    }

    #[test]
    fn invalid_utf8_is_a_parse_error() {
        let bytes: &[u8] = b"<p>ok</p><p>\xff\xfe</p>";
        let got: Vec<_> = SnippetReader::new(bytes).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], Ok(Snippet::new("ok\n", 3, "/p")));
        assert!(matches!(got[1], Err(Error::Parse(_))));
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn read_failure_is_reported_once() {
        let mut reader = SnippetReader::new(Broken);
        assert!(matches!(reader.next(), Some(Err(Error::InputRead(_)))));
        assert!(reader.next().is_none());
    }

    fn element() -> impl Strategy<Value = String> {
        let leaf = prop_oneof![
            "[a-z ]{0,8}".prop_map(|s| s),
            Just("<br>".to_string()),
            Just("&amp;".to_string()),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            (
                prop::sample::select(vec!["p", "div", "span", "b", "li", "script", "td"]),
                prop::collection::vec(inner, 0..4),
            )
                .prop_map(|(tag, children)| format!("<{tag}>{}</{tag}>", children.concat()))
        })
    }

    proptest! {
        #[test]
        fn snippet_offsets_never_decrease(doc in prop::collection::vec(element(), 1..4)) {
            let html = format!("<html>{}</html>", doc.concat());
            let got = read_snippets(&html).unwrap();
            for pair in got.windows(2) {
                prop_assert!(pair[0].offset <= pair[1].offset, "{:?}", got);
            }
            for s in &got {
                prop_assert!(s.text.ends_with('\n'));
            }
        }
    }
}
