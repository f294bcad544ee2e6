use std::ops::Range;

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

use crate::formats::Section;

/// A top-level markdown block, as far as sectioning is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading { level: u8, title: String },
    Other { markdown: String },
}

pub fn parse_sections(markdown: &str) -> Vec<Section> {
    sections_from_blocks(parse_blocks(markdown))
}

/// Splits `markdown` into its top-level blocks in document order.
///
/// Heading titles keep only the plain text of their inline children. Every
/// other block keeps its own markdown source, minus trailing line breaks.
pub fn parse_blocks(markdown: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut heading: Option<(u8, String)> = None;

    for (event, range) in Parser::new_ext(markdown, markdown_options()).into_offset_iter() {
        match event {
            Event::Start(tag) => {
                if depth == 0 {
                    match tag {
                        Tag::Heading { level, .. } => {
                            heading = Some((heading_depth(level), String::new()));
                        }
                        _ => push_other(&mut blocks, markdown, range),
                    }
                }
                depth += 1;
            }
            Event::End(tag) => {
                depth = depth.saturating_sub(1);
                if depth == 0
                    && matches!(tag, TagEnd::Heading(_))
                    && let Some((level, title)) = heading.take()
                {
                    blocks.push(Block::Heading {
                        level,
                        title: title.trim().to_owned(),
                    });
                }
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, title)) = heading.as_mut() {
                    title.push_str(&text);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if let Some((_, title)) = heading.as_mut() {
                    title.push(' ');
                }
            }
            _ if depth == 0 => push_other(&mut blocks, markdown, range),
            _ => {}
        }
    }

    blocks
}

pub fn sections_from_blocks(blocks: impl IntoIterator<Item = Block>) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = OpenSection::preamble();

    for block in blocks {
        match block {
            Block::Heading { level, title } => {
                let previous = std::mem::replace(&mut current, OpenSection::new(level, title));
                if !previous.is_empty_preamble() {
                    sections.push(previous.close());
                }
            }
            Block::Other { markdown } => {
                current.content.push_str(&markdown);
                current.content.push('\n');
            }
        }
    }

    sections.push(current.close());
    sections
}

pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_hyphen = false;

    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

#[derive(Debug)]
struct OpenSection {
    level: u8,
    title: String,
    content: String,
    implicit: bool,
}

impl OpenSection {
    fn preamble() -> Self {
        Self {
            level: 1,
            title: String::new(),
            content: String::new(),
            implicit: true,
        }
    }

    fn new(level: u8, title: String) -> Self {
        Self {
            level,
            title,
            content: String::new(),
            implicit: false,
        }
    }

    fn is_empty_preamble(&self) -> bool {
        self.implicit && self.content.is_empty()
    }

    fn close(self) -> Section {
        let slug = slugify(&self.title);
        Section {
            level: self.level,
            title: self.title,
            content: self.content,
            slug,
        }
    }
}

fn markdown_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
}

fn heading_depth(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn push_other(blocks: &mut Vec<Block>, markdown: &str, range: Range<usize>) {
    let Some(source) = markdown.get(range) else {
        return;
    };
    let source = source.trim_end_matches(['\n', '\r']);
    if source.trim().is_empty() {
        return;
    }
    blocks.push(Block::Other {
        markdown: source.to_owned(),
    });
}
