//! Side-channel extraction and sink-side text cleanup.
//!
//! The model may embed out-of-band markers in its reply (here: emoji meant as
//! a reaction to the user's message). Extraction runs over the whole
//! accumulated text after every chunk. While the reply still grows only its
//! settled part is cleaned, so the cleaned text never loses characters it
//! already showed.

use crate::error::CoreError;
use regex::{Captures, Regex};

/// Result of one extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Text with every marker removed, ready for the chunker
    pub cleaned: String,
    /// Unique markers in order of first appearance
    pub markers: Vec<String>,
}

impl Extraction {
    pub fn first_marker(&self) -> Option<&str> {
        self.markers.first().map(String::as_str)
    }
}

/// Pure function from accumulated text to cleaned text plus markers.
pub trait SideChannelExtractor: Send + Sync {
    /// Extract from a finished text.
    fn extract(&self, text: &str) -> Extraction;

    /// Extract from a text that may still grow. The cleaned result must be a
    /// prefix of the cleaned result of every longer text starting with
    /// `text`, finished or not.
    fn extract_streaming(&self, text: &str) -> Extraction {
        self.extract(text)
    }
}

/// Leaves the text untouched and reports no markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtraction;

impl SideChannelExtractor for NoExtraction {
    fn extract(&self, text: &str) -> Extraction {
        Extraction {
            cleaned: text.to_string(),
            markers: Vec::new(),
        }
    }
}

const EMOJI_PATTERN: &str = r"\p{Regional_Indicator}{2}|\p{Extended_Pictographic}[\x{FE0E}\x{FE0F}]?\p{Emoji_Modifier}?(?:\x{200D}\p{Extended_Pictographic}[\x{FE0E}\x{FE0F}]?\p{Emoji_Modifier}?)*";

/// Custom server emoji whose name starts with this prefix survive cleanup.
pub const KEPT_CUSTOM_EMOJI_PREFIX: &str = "zzz";

/// Openers of a persona response prefix, besides the persona name.
const PREFIX_SPEAKERS: &[&str] = &["toi", "moi"];

const PREFIX_VERBS: &[&str] = &["répond", "a répondu", "dit", "says", "replies"];

const SMILEYS: &[(&str, &str)] = &[
    (":-)", "🙂"),
    (":)", "🙂"),
    (":-(", "☹️"),
    (":(", "☹️"),
    (":-D", "😃"),
    (":D", "😃"),
    (":-O", "😮"),
    (":O", "😮"),
    (":-o", "😮"),
    (":o", "😮"),
    (";-)", "😉"),
    (";)", "😉"),
    (":-P", "😛"),
    (":P", "😛"),
    (":-p", "😛"),
    (":p", "😛"),
    (":-|", "😐"),
    (":|", "😐"),
    ("><)", "😁"),
    ("<3", "❤️"),
    (":-*", "😘"),
    (":*", "😘"),
];

/// Emoji-reaction extractor for persona replies.
///
/// Strips persona response prefixes the model sometimes echoes, converts
/// textual smileys into emoji, reports every emoji as a marker and removes
/// them (plus custom emoji codes) from the visible text.
///
/// Every pattern except the persona prefix stays within one word, so a
/// growing text is settled up to its last whitespace, or up to the start of
/// its last line while that line may still turn into a prefix.
#[derive(Debug, Clone)]
pub struct ReactionExtractor {
    persona: String,
    prefix: Regex,
    smiley: Regex,
    emoji: Regex,
    custom_emoji: Regex,
    empty_custom_emoji: Regex,
    colon_code: Regex,
    bare_tag: Regex,
}

impl ReactionExtractor {
    pub fn new(persona_name: &str) -> Result<Self, CoreError> {
        let prefix = format!(
            r"(?im)^[ \t]*(?:TOI|MOI|{name})?[ \t]*(?:\([^)\n]*\))?[ \t]*(?:répond|a répondu|dit|says|replies)[ \t]*:[ \t]*",
            name = regex::escape(persona_name)
        );
        let smiley = format!(
            "({})([ \\n])",
            SMILEYS
                .iter()
                .map(|(text, _)| regex::escape(text))
                .collect::<Vec<_>>()
                .join("|")
        );

        Ok(Self {
            persona: persona_name.to_lowercase(),
            prefix: compile(&prefix)?,
            smiley: compile(&smiley)?,
            emoji: compile(EMOJI_PATTERN)?,
            custom_emoji: compile(r"<a?:([a-zA-Z0-9_]+):[0-9]+>")?,
            empty_custom_emoji: compile(r"<:([a-zA-Z0-9_]+):>")?,
            colon_code: compile(r":([a-zA-Z0-9_]+):")?,
            bare_tag: compile(r"<[a-zA-Z0-9_]+>")?,
        })
    }

    /// Byte length of the part of a growing `text` that later text can no
    /// longer change.
    pub fn settled_len(&self, text: &str) -> usize {
        let mut settled = text
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .last()
            .map(|(idx, c)| idx + c.len_utf8())
            .unwrap_or(0);

        let line_start = text.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
        let line = &text[line_start..];
        if self.prefix_may_follow(line) {
            settled = settled.min(line_start);
        } else if let Some(found) = self.prefix.find(line) {
            if found.start() == 0 && line_start + found.end() > settled {
                settled = line_start;
            }
        }
        settled
    }

    /// Whether `line` is an unfinished persona response prefix.
    fn prefix_may_follow(&self, line: &str) -> bool {
        let line = line.to_lowercase();
        let rest = skip_blanks(&line);
        let speakers = PREFIX_SPEAKERS
            .iter()
            .copied()
            .chain(std::iter::once(self.persona.as_str()));
        for speaker in speakers {
            if speaker.starts_with(rest) {
                return true;
            }
            if let Some(tail) = rest.strip_prefix(speaker) {
                if prefix_rest_may_follow(skip_blanks(tail)) {
                    return true;
                }
            }
        }
        prefix_rest_may_follow(rest)
    }

    fn strip_prefixes(&self, text: &str) -> String {
        self.prefix.replace_all(text, "").into_owned()
    }

    fn convert_smileys(&self, text: &str) -> String {
        self.smiley
            .replace_all(text, |caps: &Captures| {
                let emoji = SMILEYS
                    .iter()
                    .find(|(smiley, _)| *smiley == &caps[1])
                    .map(|(_, emoji)| *emoji)
                    .unwrap_or_default();
                format!("{}{}", emoji, &caps[2])
            })
            .into_owned()
    }

    fn remove_emojis(&self, text: &str) -> String {
        let text = self.emoji.replace_all(text, "");
        let text = keep_prefixed(&self.custom_emoji, &text);
        let text = keep_prefixed(&self.empty_custom_emoji, &text);
        let text = keep_prefixed(&self.colon_code, &text);
        self.bare_tag.replace_all(&text, "").into_owned()
    }
}

impl SideChannelExtractor for ReactionExtractor {
    fn extract_streaming(&self, text: &str) -> Extraction {
        self.extract(&text[..self.settled_len(text)])
    }

    fn extract(&self, text: &str) -> Extraction {
        let text = self.convert_smileys(&self.strip_prefixes(text));

        let mut markers: Vec<String> = Vec::new();
        for found in self.emoji.find_iter(&text) {
            if !markers.iter().any(|m| m == found.as_str()) {
                markers.push(found.as_str().to_string());
            }
        }

        Extraction {
            cleaned: self.remove_emojis(&text),
            markers,
        }
    }
}

fn skip_blanks(text: &str) -> &str {
    text.trim_start_matches([' ', '\t'])
}

/// Whether `rest`, found after the speaker, can still grow into
/// `(aside) verb :`.
fn prefix_rest_may_follow(rest: &str) -> bool {
    if rest.is_empty() {
        return true;
    }
    if let Some(aside) = rest.strip_prefix('(') {
        match aside.find(')') {
            None => return true,
            Some(close) => {
                if verb_may_follow(skip_blanks(&aside[close + 1..])) {
                    return true;
                }
            }
        }
    }
    verb_may_follow(rest)
}

fn verb_may_follow(rest: &str) -> bool {
    if rest.is_empty() {
        return true;
    }
    PREFIX_VERBS.iter().any(|verb| {
        verb.starts_with(rest)
            || rest
                .strip_prefix(verb)
                .is_some_and(|tail| skip_blanks(tail).is_empty())
    })
}

/// Remove every match of `re` unless its first group starts with the kept
/// custom-emoji prefix.
fn keep_prefixed(re: &Regex, text: &str) -> String {
    re.replace_all(text, |caps: &Captures| {
        if caps[1].starts_with(KEPT_CUSTOM_EMOJI_PREFIX) {
            caps[0].to_string()
        } else {
            String::new()
        }
    })
    .into_owned()
}

fn compile(pattern: &str) -> Result<Regex, CoreError> {
    Regex::new(pattern).map_err(|e| CoreError::Config(format!("Invalid pattern: {}", e)))
}

/// Formatting applied to every unit body right before it reaches the sink.
#[derive(Debug, Clone)]
pub struct SinkCleaner {
    numeric_entity: Regex,
    hex_entity: Regex,
    markdown_link: Regex,
    bare_link: Regex,
    digit_tag: Regex,
    stray_bracket: Regex,
    word: Regex,
}

impl SinkCleaner {
    pub fn new() -> Result<Self, CoreError> {
        Ok(Self {
            numeric_entity: compile(r"&#(\d+);")?,
            hex_entity: compile(r"&#x([0-9a-fA-F]+);")?,
            markdown_link: compile(r"\[([^\]]+)\]\((https?://[^)]+)\)")?,
            bare_link: compile(r"https?://[^\s>]+")?,
            digit_tag: compile(r"<\d>")?,
            stray_bracket: compile(r"(^|\n)[<>][ \t\r\n]+")?,
            word: compile(r"[A-Za-z0-9_/=]+")?,
        })
    }

    /// Entities decoded, links wrapped so the destination does not embed
    /// them, bare channel ids turned into mentions, HTML comments and leading
    /// whitespace dropped.
    pub fn clean(&self, text: &str) -> String {
        let text = self.decode_entities(text);
        let text = self.wrap_links(&text);
        let text = self.mention_channels(&text);
        self.strip_noise(&text)
    }

    fn decode_entities(&self, text: &str) -> String {
        let text = text
            .replace("&#39;", "'")
            .replace("&quot;", "\"")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">");
        let text = decode_codepoints(&self.numeric_entity, &text, 10);
        decode_codepoints(&self.hex_entity, &text, 16)
    }

    fn wrap_links(&self, text: &str) -> String {
        let text = self.markdown_link.replace_all(text, "$1: <$2>");

        let mut wrapped = String::with_capacity(text.len());
        let mut last = 0;
        for link in self.bare_link.find_iter(&text) {
            wrapped.push_str(&text[last..link.start()]);
            if text[..link.start()].ends_with('<') {
                wrapped.push_str(link.as_str());
            } else {
                wrapped.push('<');
                wrapped.push_str(link.as_str());
                wrapped.push('>');
            }
            last = link.end();
        }
        wrapped.push_str(&text[last..]);
        wrapped
    }

    /// A standalone 17 to 19 digit snowflake becomes `<#id>`. Ids already
    /// inside a mention and ids that are part of a path or query stay.
    fn mention_channels(&self, text: &str) -> String {
        let mut mentioned = String::with_capacity(text.len());
        let mut last = 0;
        for word in self.word.find_iter(text) {
            let id = word.as_str();
            let is_snowflake = (17..=19).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_digit());
            if !is_snowflake
                || text[..word.start()].ends_with("<#")
                || text[word.end()..].starts_with('>')
            {
                continue;
            }
            mentioned.push_str(&text[last..word.start()]);
            mentioned.push_str("<#");
            mentioned.push_str(id);
            mentioned.push('>');
            last = word.end();
        }
        mentioned.push_str(&text[last..]);
        mentioned
    }

    fn strip_noise(&self, text: &str) -> String {
        let text = text.replace("<!---->", "");
        let text = text.trim_start();
        let text = self.digit_tag.replace_all(text, "");
        let text = self.stray_bracket.replace_all(&text, "$1");
        match text.strip_prefix("<>\n").or_else(|| text.strip_prefix("<>\r\n")) {
            Some(rest) => rest.to_string(),
            None => text.into_owned(),
        }
    }
}

fn decode_codepoints(re: &Regex, text: &str, radix: u32) -> String {
    re.replace_all(text, |caps: &Captures| {
        u32::from_str_radix(&caps[1], radix)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}
