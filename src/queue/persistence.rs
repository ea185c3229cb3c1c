//! The queue file: an XML document of bundles and their downloads.
//!
//! ```text
//! <Downloads Version="2">
//!   <Bundle Token="17" Target="/dl/Album/" Priority="3" AutoPriority="0" Added="...">
//!     <Download Target="/dl/Album/01.flac" Size="..." TTH="..." Priority="3"
//!               AutoPriority="0" Added="..." TempTarget="..." MaxSegments="4">
//!       <Segment Start="0" Size="1048576"/>
//!       <Source CID="..." Nick="alice" HubHint="adc://hub:411"/>
//!     </Download>
//!     <Finished Target="/dl/Album/02.flac" Size="..." TTH="..." Added="..."/>
//!   </Bundle>
//!   <File Token="18" Target="/dl/single.iso" ...>
//!     <Download .../>
//!   </File>
//! </Downloads>
//! ```
//!
//! File lists are not saved.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::bundle::{Bundle, BundleKind, BundleToken};
use super::error::QueueError;
use super::item::QueueItem;
use super::priority::Priority;
use super::segment::Segment;
use crate::constants::{BACKUP_SUFFIX, QUEUE_FILE_VERSION};
use crate::hash::TthValue;
use crate::user::UserId;
use crate::xml::{self, Element};

/// One download as read from the file, before it gets an id.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedItem {
    pub target: String,
    pub size: u64,
    pub tth: TthValue,
    pub priority: Priority,
    pub auto_priority: bool,
    pub added: u64,
    pub temp_target: String,
    pub max_segments: u8,
    pub segments: Vec<Segment>,
    pub sources: Vec<LoadedSource>,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSource {
    pub user: UserId,
    pub nick: String,
    pub hub: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedBundle {
    pub token: BundleToken,
    pub target: String,
    pub kind: BundleKind,
    pub priority: Priority,
    pub auto_priority: bool,
    pub added: u64,
    pub items: Vec<LoadedItem>,
}

fn bool_attr(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn item_element(item: &QueueItem) -> Element {
    if item.is_finished() {
        return Element::new("Finished")
            .with_attr("Target", &item.target)
            .with_attr("Size", item.size)
            .with_attr("TTH", item.tth)
            .with_attr("Added", item.added);
    }

    let mut element = Element::new("Download")
        .with_attr("Target", &item.target)
        .with_attr("Size", item.size)
        .with_attr("TTH", item.tth)
        .with_attr("Priority", item.priority.index())
        .with_attr("AutoPriority", bool_attr(item.auto_priority))
        .with_attr("Added", item.added)
        .with_attr("TempTarget", &item.temp_target)
        .with_attr("MaxSegments", item.max_segments);

    for segment in item.done_segments().iter() {
        element.push(
            Element::new("Segment")
                .with_attr("Start", segment.start())
                .with_attr("Size", segment.size()),
        );
    }
    for source in item.sources() {
        element.push(
            Element::new("Source")
                .with_attr("CID", source.user.user)
                .with_attr("Nick", &source.nick)
                .with_attr("HubHint", &source.user.hub),
        );
    }
    element
}

/// Builds the document for `bundles`, looking their items up with `item`.
pub fn to_document<'a>(
    bundles: impl Iterator<Item = &'a Bundle>,
    item: impl Fn(super::item::QueueItemId) -> Option<&'a QueueItem>,
) -> Element {
    let mut root = Element::new("Downloads").with_attr("Version", QUEUE_FILE_VERSION);

    let mut bundles: Vec<&Bundle> = bundles.collect();
    bundles.sort_by(|a, b| a.target.cmp(&b.target));

    for bundle in bundles {
        let name = match bundle.kind {
            BundleKind::Directory => "Bundle",
            BundleKind::File => "File",
        };
        let mut element = Element::new(name)
            .with_attr("Token", bundle.token)
            .with_attr("Target", &bundle.target)
            .with_attr("Priority", bundle.priority.index())
            .with_attr("AutoPriority", bool_attr(bundle.auto_priority))
            .with_attr("Added", bundle.added);

        for id in bundle.items().iter().chain(bundle.finished_items()) {
            if let Some(item) = item(*id) {
                element.push(item_element(item));
            }
        }
        root.push(element);
    }
    root
}

fn required<'a>(element: &'a Element, name: &str) -> Result<&'a str, String> {
    element
        .attr(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("<{}> without {}", element.name, name))
}

fn number<T: std::str::FromStr>(element: &Element, name: &str) -> Result<T, String> {
    required(element, name)?
        .parse()
        .map_err(|_| format!("<{}> has a bad {}", element.name, name))
}

fn priority(element: &Element) -> Priority {
    element
        .attr("Priority")
        .and_then(|p| p.parse::<usize>().ok())
        .and_then(Priority::from_index)
        .unwrap_or_default()
}

fn parse_item(element: &Element) -> Result<LoadedItem, String> {
    let target = required(element, "Target")?.to_string();
    let size: u64 = number(element, "Size")?;
    if size == 0 {
        return Err(format!("{target}: zero size"));
    }
    let tth: TthValue = required(element, "TTH")?
        .parse()
        .map_err(|_| format!("{target}: bad TTH"))?;
    let added = element.attr("Added").and_then(|a| a.parse().ok()).unwrap_or(0);
    let finished = element.name == "Finished";

    let mut segments = Vec::new();
    let mut sources = Vec::new();
    for child in &element.children {
        match child.name.as_str() {
            "Segment" => {
                let start: Result<u64, _> = number(child, "Start");
                let len: Result<u64, _> = number(child, "Size");
                match (start, len) {
                    (Ok(start), Ok(len)) if start.saturating_add(len) <= size => {
                        segments.push(Segment::new(start, len));
                    }
                    _ => warn!(%target, "skipping bad segment"),
                }
            }
            "Source" => {
                let user = child.attr("CID").and_then(|c| c.parse::<UserId>().ok());
                match user {
                    Some(user) => sources.push(LoadedSource {
                        user,
                        nick: child.attr("Nick").unwrap_or_default().to_string(),
                        hub: child.attr("HubHint").unwrap_or_default().to_string(),
                    }),
                    None => warn!(%target, "skipping source without a valid CID"),
                }
            }
            _ => {}
        }
    }

    Ok(LoadedItem {
        temp_target: element.attr("TempTarget").unwrap_or_default().to_string(),
        max_segments: element
            .attr("MaxSegments")
            .and_then(|m| m.parse().ok())
            .unwrap_or(1),
        priority: priority(element),
        auto_priority: element.attr("AutoPriority") == Some("1"),
        target,
        size,
        tth,
        added,
        segments,
        sources,
        finished,
    })
}

fn parse_bundle(element: &Element) -> Result<LoadedBundle, String> {
    let kind = match element.name.as_str() {
        "Bundle" => BundleKind::Directory,
        _ => BundleKind::File,
    };
    let target = required(element, "Target")?.to_string();
    let token = element
        .attr("Token")
        .and_then(|t| t.parse().ok())
        .map(BundleToken)
        .unwrap_or_else(BundleToken::generate);

    let mut items = Vec::new();
    for child in &element.children {
        if child.name != "Download" && child.name != "Finished" {
            continue;
        }
        match parse_item(child) {
            Ok(item) => items.push(item),
            Err(reason) => warn!(bundle = %target, %reason, "skipping queue entry"),
        }
    }

    Ok(LoadedBundle {
        token,
        priority: priority(element),
        auto_priority: element.attr("AutoPriority") == Some("1"),
        added: element.attr("Added").and_then(|a| a.parse().ok()).unwrap_or(0),
        target,
        kind,
        items,
    })
}

/// Reads every well-formed bundle; malformed entries are skipped.
pub fn from_document(root: &Element) -> Result<Vec<LoadedBundle>, String> {
    if root.name != "Downloads" {
        return Err(format!("unexpected root <{}>", root.name));
    }
    let mut bundles = Vec::new();
    for child in &root.children {
        if child.name != "Bundle" && child.name != "File" {
            continue;
        }
        match parse_bundle(child) {
            Ok(bundle) => bundles.push(bundle),
            Err(reason) => warn!(%reason, "skipping bundle"),
        }
    }
    Ok(bundles)
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `contents` to `<path>.tmp`, keeps the old file as the backup and
/// moves the new one into place.
pub async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), QueueError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, contents).await?;
    if tokio::fs::try_exists(path).await? {
        tokio::fs::rename(path, backup_path(path)).await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = contents.len(), "queue saved");
    Ok(())
}

async fn read_document(path: &Path) -> Result<Element, QueueError> {
    let data = tokio::fs::read(path).await?;
    xml::parse(&data).map_err(|e| QueueError::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Parses the queue file, falling back to the backup when it is unreadable.
pub async fn read_with_backup(path: &Path) -> Result<Element, QueueError> {
    match read_document(path).await {
        Ok(root) => Ok(root),
        Err(err) => {
            let backup = backup_path(path);
            warn!(path = %path.display(), error = %err, "queue file unreadable, trying backup");
            read_document(&backup).await.map_err(|_| err)
        }
    }
}
