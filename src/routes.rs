use std::path::{Path, PathBuf};

use crate::walk;

pub const DOCS_ROUTE: &str = "/docs";

const PAGE_FILE_STEM: &str = "page";
const PAGE_EXTENSIONS: &[&str] = &["tsx", "ts", "jsx", "js", "mdx", "md"];
const DOC_EXTENSIONS: &[&str] = &["md", "mdx"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocFile {
    pub route: String,
    pub path: PathBuf,
}

/// Builds a route from page-tree directory segments.
///
/// Route groups `(name)`, dynamic segments `[name]`, `[...name]`,
/// `[[...name]]` and parallel slots `@name` do not appear in URLs.
pub fn route_from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let kept = segments
        .into_iter()
        .flat_map(|segment| segment.split('/'))
        .filter(|segment| !segment.is_empty() && !is_organizational_segment(segment))
        .collect::<Vec<_>>();

    if kept.is_empty() {
        return "/".to_owned();
    }
    format!("/{}", kept.join("/"))
}

fn is_organizational_segment(segment: &str) -> bool {
    (segment.starts_with('(') && segment.ends_with(')'))
        || (segment.starts_with('[') && segment.ends_with(']'))
        || segment.starts_with('@')
}

fn is_page_file(path: &Path) -> bool {
    let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(PAGE_FILE_STEM);
    stem_matches && has_extension(path, PAGE_EXTENSIONS)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.contains(&ext))
}

pub fn app_routes(app_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut routes = Vec::new();
    for path in walk::list_files(app_dir)? {
        if !is_page_file(&path) {
            continue;
        }
        let mut segments = walk::relative_segments(app_dir, &path)?;
        segments.pop();
        routes.push(route_from_segments(segments.iter().map(String::as_str)));
    }
    routes.sort();
    routes.dedup();
    Ok(routes)
}

/// `/docs/<relative path without extension>`.
pub fn doc_route(docs_dir: &Path, path: &Path) -> anyhow::Result<String> {
    let mut segments = walk::relative_segments(docs_dir, path)?;
    if let Some(last) = segments.last_mut()
        && let Some(stem) = Path::new(last.as_str()).file_stem()
    {
        *last = stem.to_string_lossy().into_owned();
    }
    Ok(format!("{DOCS_ROUTE}/{}", segments.join("/")))
}

pub fn doc_files(docs_dir: &Path) -> anyhow::Result<Vec<DocFile>> {
    let mut docs = Vec::new();
    for path in walk::list_files(docs_dir)? {
        if !has_extension(&path, DOC_EXTENSIONS) {
            continue;
        }
        let route = doc_route(docs_dir, &path)?;
        docs.push(DocFile { route, path });
    }
    docs.sort_by(|a, b| a.route.cmp(&b.route));
    docs.dedup_by(|dup, kept| {
        if dup.route != kept.route {
            return false;
        }
        tracing::warn!(
            route = %kept.route,
            kept = %kept.path.display(),
            skipped = %dup.path.display(),
            "two documents map to one route; keeping the first"
        );
        true
    });
    Ok(docs)
}

pub fn doc_routes(docs: &[DocFile]) -> Vec<String> {
    let mut routes = Vec::with_capacity(docs.len() + 1);
    routes.push(DOCS_ROUTE.to_owned());
    routes.extend(docs.iter().map(|doc| doc.route.clone()));
    routes.sort();
    routes.dedup();
    routes
}
