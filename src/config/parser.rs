//! Configuration File Parser
//!
//! Parses the block-structured SCST configuration text into a typed
//! [`ScstConfig`]. The format is whitespace-insensitive: braces may share a
//! line with the block header or the closing brace of an enclosing block,
//! `#` starts a comment outside quoted values, and attribute values run to
//! the end of the line with one surrounding pair of double quotes stripped.
//!
//! Errors carry the file name, line, column and an excerpt of the offending
//! line; an unclosed block is reported against the line that opened it.

use std::path::Path;

use tracing::{debug, warn};

use crate::config::{
    AttrMap, DeviceConfig, DeviceGroupConfig, DriverConfig, HandlerConfig, InitiatorGroupConfig,
    LunConfig, ScstConfig, TargetConfig, TargetGroupConfig,
};
use crate::error::{Error, Result};

/// Block and line keywords of the configuration grammar.
const KEYWORDS: &[&str] = &[
    "HANDLER",
    "DEVICE",
    "TARGET_DRIVER",
    "TARGET",
    "GROUP",
    "LUN",
    "INITIATOR",
    "DEVICE_GROUP",
    "TARGET_GROUP",
];

// =============================================================================
// Tokens
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokKind {
    Word,
    Open,
    Close,
}

#[derive(Debug, Clone, Copy)]
struct Tok {
    line: usize,
    col: usize,
    start: usize,
    end: usize,
    kind: TokKind,
}

/// Cut a line at the first `#` that is neither quoted nor escaped.
fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' if !escaped => in_quote = !in_quote,
            '#' if !in_quote && !escaped => return &line[..i],
            _ => {}
        }
        escaped = c == '\\' && !escaped;
    }
    line
}

fn tokenize_line(line_no: usize, text: &str, toks: &mut Vec<Tok>) {
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let kind = match c {
            '{' => {
                chars.next();
                TokKind::Open
            }
            '}' => {
                chars.next();
                TokKind::Close
            }
            '"' => {
                chars.next();
                for (_, q) in chars.by_ref() {
                    if q == '"' {
                        break;
                    }
                }
                TokKind::Word
            }
            _ => {
                while let Some(&(_, w)) = chars.peek() {
                    if w.is_whitespace() || w == '{' || w == '}' {
                        break;
                    }
                    chars.next();
                }
                TokKind::Word
            }
        };
        let end = chars.peek().map(|&(i, _)| i).unwrap_or(text.len());
        toks.push(Tok {
            line: line_no,
            col: start + 1,
            start,
            end,
            kind,
        });
    }
}

/// Strip exactly one pair of surrounding double quotes.
fn strip_quotes(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Split one attribute segment into key and value.
///
/// Both `key value` and `key=value` forms are accepted; the value keeps its
/// internal whitespace.
fn split_attribute(raw: &str) -> Option<(&str, &str)> {
    let head_end = raw.find(char::is_whitespace).unwrap_or(raw.len());
    let head = &raw[..head_end];
    if let Some(eq) = head.find('=') {
        let value = raw[eq + 1..].trim();
        if eq == 0 || value.is_empty() {
            return None;
        }
        return Some((&head[..eq], strip_quotes(value)));
    }
    let mut value = raw[head_end..].trim();
    if let Some(rest) = value.strip_prefix('=') {
        value = rest.trim();
    }
    if head.is_empty() || value.is_empty() {
        return None;
    }
    Some((head, strip_quotes(value)))
}

// =============================================================================
// Parser
// =============================================================================

/// SCST configuration file parser.
#[derive(Debug, Default)]
pub struct ConfigParser;

impl ConfigParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a configuration file from disk.
    pub fn parse_file(&self, path: &Path) -> Result<ScstConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Precondition(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config = self.parse(&path.display().to_string(), &content)?;
        debug!(file = %path.display(), "configuration file parsed");
        Ok(config)
    }

    /// Parse configuration text held in memory.
    pub fn parse_text(&self, content: &str) -> Result<ScstConfig> {
        self.parse("<config>", content)
    }

    fn parse(&self, file: &str, content: &str) -> Result<ScstConfig> {
        let lines: Vec<&str> = content.lines().collect();
        let mut toks = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            tokenize_line(idx + 1, strip_comment(line), &mut toks);
        }
        let mut cursor = Cursor {
            file,
            lines: &lines,
            toks,
            pos: 0,
        };
        let mut config = ScstConfig::default();
        cursor.parse_root(&mut config)?;
        Ok(config)
    }
}

struct Cursor<'a> {
    file: &'a str,
    lines: &'a [&'a str],
    toks: Vec<Tok>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<Tok> {
        self.toks.get(self.pos).copied()
    }

    fn bump(&mut self) -> Tok {
        let tok = self.toks[self.pos];
        self.pos += 1;
        tok
    }

    fn text(&self, tok: Tok) -> &'a str {
        &self.lines[tok.line - 1][tok.start..tok.end]
    }

    fn err(&self, line: usize, col: usize, message: String) -> Error {
        Error::Parse {
            file: self.file.to_string(),
            line,
            column: col,
            message,
            excerpt: self
                .lines
                .get(line.saturating_sub(1))
                .map(|l| l.trim().to_string())
                .unwrap_or_default(),
        }
    }

    fn err_tok(&self, tok: Tok, message: String) -> Error {
        self.err(tok.line, tok.col, message)
    }

    fn unclosed(&self, kind: &str, name: &str, header_line: usize) -> Error {
        self.err(
            header_line,
            1,
            format!("unclosed {kind} block '{name}' (missing '}}')"),
        )
    }

    /// Consume the block kind keyword and the name that must follow on the
    /// same line. Returns the name and the header line number.
    fn block_header(&mut self, kind: &str) -> Result<(String, usize)> {
        let kw = self.bump();
        match self.peek() {
            Some(t) if t.kind == TokKind::Word && t.line == kw.line => {
                let name_tok = self.bump();
                Ok((self.text(name_tok).to_string(), kw.line))
            }
            _ => Err(self.err_tok(kw, format!("expected name after {kind}"))),
        }
    }

    /// Consume an opening brace if one is next, on this line or a later one.
    fn try_open(&mut self) -> bool {
        if matches!(self.peek(), Some(t) if t.kind == TokKind::Open) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Consume a word that must follow `kw` on the same line.
    fn same_line_word(&mut self, kw: Tok, what: &str) -> Result<String> {
        match self.peek() {
            Some(t) if t.kind == TokKind::Word && t.line == kw.line => {
                let tok = self.bump();
                Ok(self.text(tok).to_string())
            }
            _ => Err(self.err_tok(kw, format!("expected {what}"))),
        }
    }

    // -------------------------------------------------------------------------
    // Grammar
    // -------------------------------------------------------------------------

    fn parse_root(&mut self, config: &mut ScstConfig) -> Result<()> {
        while let Some(tok) = self.peek() {
            match tok.kind {
                TokKind::Close => {
                    return Err(self.err_tok(tok, "unexpected '}' with no open block".into()))
                }
                TokKind::Open => {
                    return Err(self.err_tok(tok, "unexpected '{'".into()));
                }
                TokKind::Word => match self.text(tok) {
                    "HANDLER" => self.parse_handler(config)?,
                    "TARGET_DRIVER" => self.parse_driver(config)?,
                    "DEVICE_GROUP" => self.parse_device_group(config)?,
                    word if KEYWORDS.contains(&word) => {
                        return Err(
                            self.err_tok(tok, format!("'{word}' is not valid at top level"))
                        );
                    }
                    word if self.looks_like_block() => {
                        return Err(
                            self.err_tok(tok, format!("unknown block kind '{word}' at top level"))
                        );
                    }
                    _ => self.parse_attribute(&mut config.scst_attributes)?,
                },
            }
        }
        Ok(())
    }

    /// Lookahead: the token at the cursor starts `KIND [name] {`.
    fn looks_like_block(&self) -> bool {
        let Some(kw) = self.peek() else { return false };
        if !self
            .text(kw)
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '_')
        {
            return false;
        }
        match self.toks.get(self.pos + 1) {
            Some(t) if t.kind == TokKind::Open => true,
            Some(t) if t.kind == TokKind::Word => {
                matches!(self.toks.get(self.pos + 2), Some(n) if n.kind == TokKind::Open)
            }
            _ => false,
        }
    }

    fn parse_attribute(&mut self, map: &mut AttrMap) -> Result<()> {
        let key_tok = self.bump();
        let mut end = key_tok.end;
        while let Some(t) = self.peek() {
            if t.kind == TokKind::Word && t.line == key_tok.line {
                end = t.end;
                self.bump();
            } else {
                break;
            }
        }
        let raw = &self.lines[key_tok.line - 1][key_tok.start..end];
        let Some((key, value)) = split_attribute(raw) else {
            return Err(self.err_tok(key_tok, format!("expected value for attribute '{raw}'")));
        };
        if map.insert(key.to_string(), value.to_string()).is_some() {
            warn!(
                line = key_tok.line,
                attribute = key,
                "duplicate attribute overrides earlier value"
            );
        }
        Ok(())
    }

    /// Parse a `{ attribute* }` body into `map`.
    fn parse_attr_block(
        &mut self,
        kind: &str,
        name: &str,
        header_line: usize,
        map: &mut AttrMap,
    ) -> Result<()> {
        loop {
            match self.peek() {
                None => return Err(self.unclosed(kind, name, header_line)),
                Some(t) if t.kind == TokKind::Close => {
                    self.bump();
                    return Ok(());
                }
                Some(t) if t.kind == TokKind::Open => {
                    return Err(self.err_tok(t, "unexpected '{'".into()));
                }
                Some(t) => {
                    let word = self.text(t);
                    if KEYWORDS.contains(&word) {
                        return Err(
                            self.err_tok(t, format!("'{word}' is not valid inside {kind} {name}"))
                        );
                    }
                    self.parse_attribute(map)?;
                }
            }
        }
    }

    fn parse_handler(&mut self, config: &mut ScstConfig) -> Result<()> {
        let (name, header_line) = self.block_header("HANDLER")?;
        if config.handlers.contains_key(&name) {
            return Err(self.err(header_line, 1, format!("duplicate HANDLER '{name}'")));
        }
        let mut handler = HandlerConfig::default();
        if self.try_open() {
            loop {
                match self.peek() {
                    None => return Err(self.unclosed("HANDLER", &name, header_line)),
                    Some(t) if t.kind == TokKind::Close => {
                        self.bump();
                        break;
                    }
                    Some(t) if t.kind == TokKind::Open => {
                        return Err(self.err_tok(t, "unexpected '{'".into()));
                    }
                    Some(t) => match self.text(t) {
                        "DEVICE" => self.parse_device(config, &name)?,
                        word if KEYWORDS.contains(&word) => {
                            return Err(self.err_tok(
                                t,
                                format!("'{word}' is not valid inside HANDLER {name}"),
                            ));
                        }
                        _ => self.parse_attribute(&mut handler.attributes)?,
                    },
                }
            }
        }
        config.handlers.insert(name, handler);
        Ok(())
    }

    fn parse_device(&mut self, config: &mut ScstConfig, handler: &str) -> Result<()> {
        let (name, header_line) = self.block_header("DEVICE")?;
        if config.devices.contains_key(&name) {
            return Err(self.err(header_line, 1, format!("duplicate DEVICE '{name}'")));
        }
        let mut device = DeviceConfig::new(name.clone(), handler);
        if self.try_open() {
            self.parse_attr_block("DEVICE", &name, header_line, &mut device.attributes)?;
        }
        config.devices.insert(name, device);
        Ok(())
    }

    fn parse_driver(&mut self, config: &mut ScstConfig) -> Result<()> {
        let (name, header_line) = self.block_header("TARGET_DRIVER")?;
        if config.drivers.contains_key(&name) {
            return Err(self.err(header_line, 1, format!("duplicate TARGET_DRIVER '{name}'")));
        }
        let mut driver = DriverConfig {
            name: name.clone(),
            ..Default::default()
        };
        if self.try_open() {
            loop {
                match self.peek() {
                    None => return Err(self.unclosed("TARGET_DRIVER", &name, header_line)),
                    Some(t) if t.kind == TokKind::Close => {
                        self.bump();
                        break;
                    }
                    Some(t) if t.kind == TokKind::Open => {
                        return Err(self.err_tok(t, "unexpected '{'".into()));
                    }
                    Some(t) => match self.text(t) {
                        "TARGET" => self.parse_target(&mut driver.targets)?,
                        word if KEYWORDS.contains(&word) => {
                            return Err(self.err_tok(
                                t,
                                format!("'{word}' is not valid inside TARGET_DRIVER {name}"),
                            ));
                        }
                        _ => self.parse_attribute(&mut driver.attributes)?,
                    },
                }
            }
        }
        config.drivers.insert(name, driver);
        Ok(())
    }

    fn parse_target(&mut self, targets: &mut indexmap::IndexMap<String, TargetConfig>) -> Result<()> {
        let (name, header_line) = self.block_header("TARGET")?;
        if targets.contains_key(&name) {
            return Err(self.err(header_line, 1, format!("duplicate TARGET '{name}'")));
        }
        let mut target = TargetConfig {
            name: name.clone(),
            ..Default::default()
        };
        if self.try_open() {
            loop {
                match self.peek() {
                    None => return Err(self.unclosed("TARGET", &name, header_line)),
                    Some(t) if t.kind == TokKind::Close => {
                        self.bump();
                        break;
                    }
                    Some(t) if t.kind == TokKind::Open => {
                        return Err(self.err_tok(t, "unexpected '{'".into()));
                    }
                    Some(t) => match self.text(t) {
                        "LUN" => self.parse_lun(&mut target.luns)?,
                        "GROUP" => self.parse_group(&mut target.groups)?,
                        word if KEYWORDS.contains(&word) => {
                            return Err(self.err_tok(
                                t,
                                format!("'{word}' is not valid inside TARGET {name}"),
                            ));
                        }
                        _ => self.parse_attribute(&mut target.attributes)?,
                    },
                }
            }
        }
        targets.insert(name, target);
        Ok(())
    }

    fn parse_lun(&mut self, luns: &mut indexmap::IndexMap<u64, LunConfig>) -> Result<()> {
        let kw = self.bump();
        let number_text = self.same_line_word(kw, "LUN number after 'LUN'")?;
        let number: u64 = number_text
            .parse()
            .map_err(|_| self.err_tok(kw, format!("invalid LUN number '{number_text}'")))?;
        let device = self.same_line_word(kw, &format!("device name after 'LUN {number}'"))?;
        if luns.contains_key(&number) {
            return Err(self.err_tok(kw, format!("duplicate LUN {number}")));
        }
        let mut lun = LunConfig::new(device);
        if self.try_open() {
            self.parse_attr_block("LUN", &number_text, kw.line, &mut lun.attributes)?;
        }
        luns.insert(number, lun);
        Ok(())
    }

    fn parse_group(
        &mut self,
        groups: &mut indexmap::IndexMap<String, InitiatorGroupConfig>,
    ) -> Result<()> {
        let (name, header_line) = self.block_header("GROUP")?;
        if groups.contains_key(&name) {
            return Err(self.err(header_line, 1, format!("duplicate GROUP '{name}'")));
        }
        let mut group = InitiatorGroupConfig {
            name: name.clone(),
            ..Default::default()
        };
        if self.try_open() {
            loop {
                match self.peek() {
                    None => return Err(self.unclosed("GROUP", &name, header_line)),
                    Some(t) if t.kind == TokKind::Close => {
                        self.bump();
                        break;
                    }
                    Some(t) if t.kind == TokKind::Open => {
                        return Err(self.err_tok(t, "unexpected '{'".into()));
                    }
                    Some(t) => match self.text(t) {
                        "INITIATOR" => {
                            let kw = self.bump();
                            let initiator = self.same_line_word(kw, "initiator name")?;
                            if group.initiators.contains(&initiator) {
                                return Err(
                                    self.err_tok(kw, format!("duplicate INITIATOR '{initiator}'"))
                                );
                            }
                            group.initiators.push(initiator);
                        }
                        "LUN" => self.parse_lun(&mut group.luns)?,
                        word if KEYWORDS.contains(&word) => {
                            return Err(self.err_tok(
                                t,
                                format!("'{word}' is not valid inside GROUP {name}"),
                            ));
                        }
                        _ => self.parse_attribute(&mut group.attributes)?,
                    },
                }
            }
        }
        groups.insert(name, group);
        Ok(())
    }

    fn parse_device_group(&mut self, config: &mut ScstConfig) -> Result<()> {
        let (name, header_line) = self.block_header("DEVICE_GROUP")?;
        if config.device_groups.contains_key(&name) {
            return Err(self.err(header_line, 1, format!("duplicate DEVICE_GROUP '{name}'")));
        }
        let mut group = DeviceGroupConfig {
            name: name.clone(),
            ..Default::default()
        };
        if self.try_open() {
            loop {
                match self.peek() {
                    None => return Err(self.unclosed("DEVICE_GROUP", &name, header_line)),
                    Some(t) if t.kind == TokKind::Close => {
                        self.bump();
                        break;
                    }
                    Some(t) if t.kind == TokKind::Open => {
                        return Err(self.err_tok(t, "unexpected '{'".into()));
                    }
                    Some(t) => match self.text(t) {
                        "DEVICE" => {
                            let kw = self.bump();
                            let device = self.same_line_word(kw, "device name")?;
                            if group.devices.contains(&device) {
                                return Err(
                                    self.err_tok(kw, format!("duplicate DEVICE '{device}'"))
                                );
                            }
                            group.devices.push(device);
                        }
                        "TARGET_GROUP" => self.parse_target_group(&mut group.target_groups)?,
                        word if KEYWORDS.contains(&word) => {
                            return Err(self.err_tok(
                                t,
                                format!("'{word}' is not valid inside DEVICE_GROUP {name}"),
                            ));
                        }
                        _ => self.parse_attribute(&mut group.attributes)?,
                    },
                }
            }
        }
        config.device_groups.insert(name, group);
        Ok(())
    }

    fn parse_target_group(
        &mut self,
        target_groups: &mut indexmap::IndexMap<String, TargetGroupConfig>,
    ) -> Result<()> {
        let (name, header_line) = self.block_header("TARGET_GROUP")?;
        if target_groups.contains_key(&name) {
            return Err(self.err(header_line, 1, format!("duplicate TARGET_GROUP '{name}'")));
        }
        let mut group = TargetGroupConfig {
            name: name.clone(),
            ..Default::default()
        };
        if self.try_open() {
            loop {
                match self.peek() {
                    None => return Err(self.unclosed("TARGET_GROUP", &name, header_line)),
                    Some(t) if t.kind == TokKind::Close => {
                        self.bump();
                        break;
                    }
                    Some(t) if t.kind == TokKind::Open => {
                        return Err(self.err_tok(t, "unexpected '{'".into()));
                    }
                    Some(t) => match self.text(t) {
                        "TARGET" => {
                            let kw = self.bump();
                            let target = self.same_line_word(kw, "target name")?;
                            if group.targets.contains(&target) {
                                return Err(
                                    self.err_tok(kw, format!("duplicate TARGET '{target}'"))
                                );
                            }
                            if self.try_open() {
                                let mut attrs = AttrMap::new();
                                self.parse_attr_block("TARGET", &target, kw.line, &mut attrs)?;
                                group.target_attributes.insert(target.clone(), attrs);
                            }
                            group.targets.push(target);
                        }
                        word if KEYWORDS.contains(&word) => {
                            return Err(self.err_tok(
                                t,
                                format!("'{word}' is not valid inside TARGET_GROUP {name}"),
                            ));
                        }
                        _ => self.parse_attribute(&mut group.attributes)?,
                    },
                }
            }
        }
        target_groups.insert(name, group);
        Ok(())
    }
}
