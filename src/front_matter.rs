use anyhow::Context as _;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DocFrontMatter {
    #[serde(default)]
    pub title: Option<String>,
}

/// Splits a markdown document into its YAML front matter and body.
///
/// Documents that do not open with a `---` line have no front matter and the
/// whole input is the body.
pub fn split_front_matter(contents: &str) -> anyhow::Result<(Option<DocFrontMatter>, &str)> {
    let mut lines = contents.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return Ok((None, contents));
    };
    if first.trim_end() != "---" {
        return Ok((None, contents));
    }

    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        if line.trim_end() == "---" {
            let yaml = &contents[yaml_start..offset];
            let body = &contents[offset + line.len()..];
            let front = parse_yaml(yaml)?;
            return Ok((Some(front), body));
        }
        offset += line.len();
    }

    anyhow::bail!("front matter is not closed ('---')");
}

fn parse_yaml(yaml: &str) -> anyhow::Result<DocFrontMatter> {
    if yaml.trim().is_empty() {
        return Ok(DocFrontMatter::default());
    }
    serde_yaml::from_str(yaml).context("deserialize document front matter")
}
