use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use sha2::Digest as _;

use crate::cli::{ManifestArgs, SectionsArgs};
use crate::formats::{FullTextMeta, OfflineManifest};
use crate::front_matter::split_front_matter;
use crate::routes::{self, DocFile};
use crate::sections::parse_sections;
use crate::walk;

pub const BUILD_STATIC_PREFIX: &str = "/_next/static";

/// Where the manifest builder reads from and writes to.
#[derive(Debug, Clone)]
pub struct SiteLayout {
    pub app_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub public_dir: PathBuf,
    pub build_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub service_worker_path: PathBuf,
    pub search_index_dir: PathBuf,
}

impl SiteLayout {
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let public_dir = root.join("public");
        Self {
            app_dir: root.join("src").join("app"),
            docs_dir: root.join("docs"),
            manifest_path: public_dir.join("offline-manifest.json"),
            service_worker_path: public_dir.join("sw.js"),
            search_index_dir: public_dir.join("search-index"),
            build_dir: root.join(".next"),
            public_dir,
        }
    }

    fn from_args(args: &ManifestArgs) -> Self {
        let mut layout = Self::from_root(&args.root);
        if let Some(dir) = &args.app_dir {
            layout.app_dir = dir.clone();
        }
        if let Some(dir) = &args.docs_dir {
            layout.docs_dir = dir.clone();
        }
        if let Some(dir) = &args.public_dir {
            layout.public_dir = dir.clone();
            layout.manifest_path = dir.join("offline-manifest.json");
            layout.service_worker_path = dir.join("sw.js");
            layout.search_index_dir = dir.join("search-index");
        }
        if let Some(dir) = &args.build_dir {
            layout.build_dir = dir.clone();
        }
        if let Some(path) = &args.out {
            layout.manifest_path = path.clone();
        }
        if let Some(path) = &args.service_worker {
            layout.service_worker_path = path.clone();
        }
        if let Some(dir) = &args.search_index_dir {
            layout.search_index_dir = dir.clone();
        }
        layout
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.manifest_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Asset paths the builder must never list.
    fn excluded_assets(&self) -> BTreeSet<String> {
        [&self.manifest_path, &self.service_worker_path]
            .into_iter()
            .filter_map(|path| walk::url_path(&self.public_dir, path).ok())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub full_text: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { full_text: true }
    }
}

pub fn run(args: ManifestArgs) -> anyhow::Result<()> {
    let layout = SiteLayout::from_args(&args);
    let options = BuildOptions {
        full_text: !args.no_full_text,
    };

    let _lock = BuildLock::acquire(&layout.lock_path()).context("lock manifest output")?;

    let manifest = build_manifest(&layout, options).context("build offline manifest")?;
    write_manifest(&layout, &manifest).context("write offline manifest")?;

    tracing::info!(
        routes = manifest.routes.len(),
        assets = manifest.assets.len(),
        documents = manifest.full_text_metas.as_ref().map_or(0, Vec::len),
        out = %layout.manifest_path.display(),
        "offline manifest written"
    );
    Ok(())
}

pub fn build_manifest(layout: &SiteLayout, options: BuildOptions) -> anyhow::Result<OfflineManifest> {
    let app_routes = routes::app_routes(&layout.app_dir).context("collect app routes")?;
    let docs = routes::doc_files(&layout.docs_dir).context("collect documentation files")?;
    let doc_routes = routes::doc_routes(&docs);
    tracing::debug!(
        app = app_routes.len(),
        docs = doc_routes.len(),
        "collected routes"
    );

    let routes = app_routes
        .into_iter()
        .chain(doc_routes)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let excluded = layout.excluded_assets();
    let assets = static_assets(layout)
        .context("collect static assets")?
        .into_iter()
        .chain(build_output_assets(&layout.build_dir).context("collect build output assets")?)
        .filter(|asset| !excluded.contains(asset))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let full_text_metas = if options.full_text {
        Some(full_text_metas(&docs))
    } else {
        None
    };

    Ok(OfflineManifest {
        generated_at: chrono::Utc::now(),
        routes,
        assets,
        full_text_metas,
    })
}

/// Files under the public root, minus the builder's own outputs.
pub fn static_assets(layout: &SiteLayout) -> anyhow::Result<Vec<String>> {
    let mut assets = Vec::new();
    for path in walk::list_files(&layout.public_dir)? {
        if path == layout.manifest_path
            || path == layout.service_worker_path
            || path == layout.lock_path()
            || path.starts_with(&layout.search_index_dir)
        {
            continue;
        }
        assets.push(walk::url_path(&layout.public_dir, &path)?);
    }
    Ok(assets)
}

/// Chunks emitted into `<build>/static`, served under `/_next/static`.
pub fn build_output_assets(build_dir: &Path) -> anyhow::Result<Vec<String>> {
    let static_dir = build_dir.join("static");
    if !static_dir.is_dir() {
        tracing::debug!(dir = %static_dir.display(), "no build output; skipping build assets");
        return Ok(Vec::new());
    }

    let build_id = read_build_id(build_dir)?;
    let mut assets = Vec::new();
    let mut fingerprinted = 0usize;
    for path in walk::list_files(&static_dir)? {
        let segments = walk::relative_segments(&static_dir, &path)?;
        if build_id.as_deref() == segments.first().map(String::as_str) {
            fingerprinted += 1;
        }
        assets.push(format!("{BUILD_STATIC_PREFIX}/{}", segments.join("/")));
    }

    tracing::debug!(
        build_id = build_id.as_deref().unwrap_or("-"),
        assets = assets.len(),
        fingerprinted,
        "collected build output assets"
    );
    Ok(assets)
}

fn read_build_id(build_dir: &Path) -> anyhow::Result<Option<String>> {
    let path = build_dir.join("BUILD_ID");
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let id = raw.trim();
            Ok((!id.is_empty()).then(|| id.to_owned()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read build id: {}", path.display())),
    }
}

/// Full-text records for every readable documentation file.
///
/// A document that cannot be read or whose front matter is malformed is
/// skipped with a warning; the rest of the build goes on.
pub fn full_text_metas(docs: &[DocFile]) -> Vec<FullTextMeta> {
    let mut metas = Vec::with_capacity(docs.len());
    for doc in docs {
        match full_text_meta(doc) {
            Ok(meta) => metas.push(meta),
            Err(err) => {
                tracing::warn!(
                    route = %doc.route,
                    path = %doc.path.display(),
                    err = format!("{err:#}"),
                    "skipping document in search index"
                );
            }
        }
    }
    metas.sort_by(|a, b| a.route.cmp(&b.route));
    metas
}

/// Full-text record of a single markdown file, as pretty JSON.
pub fn dump_sections(args: SectionsArgs) -> anyhow::Result<String> {
    let doc = DocFile {
        route: args.input.display().to_string(),
        path: args.input,
    };
    let meta = full_text_meta(&doc)?;
    serde_json::to_string_pretty(&meta).context("serialize sections")
}

fn full_text_meta(doc: &DocFile) -> anyhow::Result<FullTextMeta> {
    let bytes =
        fs::read(&doc.path).with_context(|| format!("read document: {}", doc.path.display()))?;
    let contents = std::str::from_utf8(&bytes).context("document is not valid UTF-8")?;
    let (front, body) = split_front_matter(contents).context("split front matter")?;

    Ok(FullTextMeta {
        route: doc.route.clone(),
        title: front.and_then(|f| f.title),
        sections: parse_sections(body),
        content_hash: content_hash(&bytes),
    })
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `<search-index>/<route without leading slash>.json`.
pub fn search_index_path(search_index_dir: &Path, route: &str) -> PathBuf {
    let segments = route
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect::<Vec<_>>();
    let mut path = search_index_dir.to_path_buf();
    if let Some((last, parents)) = segments.split_last() {
        path.extend(parents);
        path.push(format!("{last}.json"));
    }
    path
}

pub fn write_manifest(layout: &SiteLayout, manifest: &OfflineManifest) -> anyhow::Result<()> {
    write_json_atomic(&layout.manifest_path, manifest).context("write manifest json")?;

    let Some(metas) = &manifest.full_text_metas else {
        return Ok(());
    };
    let mut written = BTreeSet::new();
    for meta in metas {
        let path = search_index_path(&layout.search_index_dir, &meta.route);
        write_json_atomic(&path, meta)
            .with_context(|| format!("write search index for {}", meta.route))?;
        written.insert(path);
    }
    prune_search_index(&layout.search_index_dir, &written).context("prune search index")?;
    tracing::debug!(
        documents = metas.len(),
        dir = %layout.search_index_dir.display(),
        "search index written"
    );
    Ok(())
}

/// Removes index files of documents that no longer exist, then any
/// directories left empty.
fn prune_search_index(dir: &Path, keep: &BTreeSet<PathBuf>) -> anyhow::Result<()> {
    let mut parents = BTreeSet::new();
    for path in walk::list_files(dir)? {
        if keep.contains(&path) {
            continue;
        }
        fs::remove_file(&path).with_context(|| format!("remove: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "removed stale search index file");
        parents.extend(
            path.ancestors()
                .skip(1)
                .filter(|p| p.starts_with(dir) && *p != dir)
                .map(Path::to_path_buf),
        );
    }

    // Deepest first, so children go before their parents.
    for parent in parents.iter().rev() {
        let is_empty = fs::read_dir(parent)
            .with_context(|| format!("read dir: {}", parent.display()))?
            .next()
            .is_none();
        if is_empty {
            fs::remove_dir(parent).with_context(|| format!("remove dir: {}", parent.display()))?;
        }
    }
    Ok(())
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let mut data = serde_json::to_vec_pretty(value).context("serialize json")?;
    data.push(b'\n');

    let mut out = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp_path)
        .with_context(|| format!("create tmp: {}", tmp_path.display()))?;
    out.write_all(&data)
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    out.flush().context("flush tmp")?;
    drop(out);

    fs::rename(&tmp_path, path)
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

/// Guards a manifest output path against concurrent builds.
struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    fn acquire(lock_path: &Path) -> anyhow::Result<Self> {
        let path = lock_path.to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create manifest dir: {}", parent.display()))?;
        }
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| {
                format!(
                    "another manifest build holds the lock (remove it if stale): {}",
                    path.display()
                )
            })?;
        Ok(Self { path })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), ?err, "failed to remove manifest lock");
        }
    }
}
