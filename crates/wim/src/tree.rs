//! The in-memory image tree: an arena of dentries and inodes.
//!
//! Hardlinks are modeled by multiple dentry ids referencing the same inode
//! id; there is no shared ownership between nodes. Parent/child edges and
//! the dentry→inode edge are plain indices into the arena vectors, and the
//! per-extraction scratch state lives beside the durable metadata so one
//! `reset_scratch` call makes the tree reusable.

use std::ffi::OsString;
use std::path::PathBuf;

use wim_dtyp::{FileAttributes, FileTime, ReparseData, ReparseTag, Sha1Hash, WideString};

/// Index of a [`Dentry`] in its [`ImageTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DentryId(pub u32);

/// Index of an [`Inode`] in its [`ImageTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(pub u32);

/// Where the bytes of a stream come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// A blob in the archive's blob table, addressed by content.
    Blob(Sha1Hash),
    /// Bytes stored inline in the metadata, outside the blob table.
    Inline(Vec<u8>),
}

/// An alternate (named) data stream of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStream {
    pub name: WideString,
    /// `None` for a zero-length stream, which has no blob at all.
    pub source: Option<StreamSource>,
}

/// POSIX ownership and mode sidecar data, when the archive carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixData {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Device number for block/character special files.
    pub rdev: u32,
}

impl UnixData {
    const S_IFMT: u32 = 0o170000;
    const S_IFIFO: u32 = 0o010000;
    const S_IFCHR: u32 = 0o020000;
    const S_IFBLK: u32 = 0o060000;
    const S_IFSOCK: u32 = 0o140000;

    /// The `S_IFMT` file-type bits of the stored mode.
    pub fn file_type(&self) -> u32 {
        self.mode & Self::S_IFMT
    }

    pub fn is_fifo(&self) -> bool {
        self.file_type() == Self::S_IFIFO
    }

    /// FIFO, device node or socket: carries no data stream and is
    /// materialized with `mkfifo`/`mknod` rather than as a regular file.
    pub fn is_special_file(&self) -> bool {
        matches!(
            self.file_type(),
            Self::S_IFIFO | Self::S_IFCHR | Self::S_IFBLK | Self::S_IFSOCK
        )
    }
}

/// A shared file object, referenced by one dentry per hard link.
#[derive(Debug)]
pub struct Inode {
    pub attributes: FileAttributes,
    pub reparse_tag: ReparseTag,
    /// Parsed reparse buffer, present iff the reparse attribute is set.
    pub reparse: Option<ReparseData>,
    /// Index into the image's security descriptor table.
    pub security_id: Option<u32>,
    pub creation_time: FileTime,
    pub last_write_time: FileTime,
    pub last_access_time: FileTime,
    /// The default data stream. `None` for directories and empty files.
    pub unnamed_stream: Option<StreamSource>,
    pub named_streams: Vec<NamedStream>,
    pub link_count: u32,
    pub unix_data: Option<UnixData>,

    pub(crate) scratch: InodeScratch,
}

#[derive(Debug, Default)]
pub(crate) struct InodeScratch {
    /// Set once blob references for this inode have been planned.
    pub visited: bool,
    /// Path of the first materialized link, used to hardlink the rest.
    pub extracted_path: Option<PathBuf>,
}

impl Inode {
    /// A plain inode with the given attributes and no streams.
    pub fn new(attributes: FileAttributes) -> Self {
        Self {
            attributes,
            reparse_tag: ReparseTag::default(),
            reparse: None,
            security_id: None,
            creation_time: FileTime::default(),
            last_write_time: FileTime::default(),
            last_access_time: FileTime::default(),
            unnamed_stream: None,
            named_streams: Vec::new(),
            link_count: 1,
            unix_data: None,
            scratch: InodeScratch::default(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.directory()
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes.reparse_point()
    }

    pub fn is_symlink(&self) -> bool {
        self.is_reparse_point() && self.reparse_tag.is_symlink()
    }

    /// A regular file: not a directory and not a reparse point.
    pub fn is_regular_file(&self) -> bool {
        !self.is_directory() && !self.is_reparse_point()
    }

    /// The blob hash of the unnamed stream, if it is blob-backed.
    pub fn unnamed_blob_hash(&self) -> Option<Sha1Hash> {
        match &self.unnamed_stream {
            Some(StreamSource::Blob(hash)) => Some(*hash),
            _ => None,
        }
    }
}

/// One name binding in the tree, exclusively owned by its parent.
#[derive(Debug)]
pub struct Dentry {
    pub name: WideString,
    /// Short (8.3 DOS) name, if the archive stored one.
    pub short_name: Option<WideString>,
    pub parent: Option<DentryId>,
    pub children: Vec<DentryId>,
    pub inode: InodeId,

    pub(crate) scratch: DentryScratch,
}

#[derive(Debug, Default)]
pub(crate) struct DentryScratch {
    /// The dentry (and its whole subtree) is excluded from extraction.
    pub skipped: bool,
    /// The dentry was materialized as a link to an earlier extraction.
    pub was_hardlinked: bool,
    /// Host-legal path component chosen by the name sanitizer.
    /// `None` on the root (which keeps the target path) and on skipped
    /// dentries.
    pub extraction_name: Option<OsString>,
    /// Transient per-blob guard against processing a dentry twice.
    pub tmp_flag: bool,
}

/// The filesystem tree of one image.
#[derive(Debug, Default)]
pub struct ImageTree {
    dentries: Vec<Dentry>,
    inodes: Vec<Inode>,
}

impl ImageTree {
    /// An empty tree with a root directory dentry.
    pub fn new() -> Self {
        let mut tree = Self {
            dentries: Vec::new(),
            inodes: Vec::new(),
        };
        let root_inode = tree.add_inode(Inode::new(FileAttributes::new().with_directory(true)));
        tree.dentries.push(Dentry {
            name: WideString::default(),
            short_name: None,
            parent: None,
            children: Vec::new(),
            inode: root_inode,
            scratch: DentryScratch::default(),
        });
        tree
    }

    pub fn root(&self) -> DentryId {
        DentryId(0)
    }

    pub fn add_inode(&mut self, inode: Inode) -> InodeId {
        let id = InodeId(self.inodes.len() as u32);
        self.inodes.push(inode);
        id
    }

    /// Adds a child dentry under `parent`, pointing at `inode`.
    pub fn add_child(&mut self, parent: DentryId, name: WideString, inode: InodeId) -> DentryId {
        let id = DentryId(self.dentries.len() as u32);
        self.dentries.push(Dentry {
            name,
            short_name: None,
            parent: Some(parent),
            children: Vec::new(),
            inode,
            scratch: DentryScratch::default(),
        });
        self.dentries[parent.0 as usize].children.push(id);
        id
    }

    pub fn dentry(&self, id: DentryId) -> &Dentry {
        &self.dentries[id.0 as usize]
    }

    pub fn dentry_mut(&mut self, id: DentryId) -> &mut Dentry {
        &mut self.dentries[id.0 as usize]
    }

    pub fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0 as usize]
    }

    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0 as usize]
    }

    /// Inode of a dentry, going through the index indirection.
    pub fn inode_of(&self, dentry: DentryId) -> &Inode {
        self.inode(self.dentry(dentry).inode)
    }

    pub fn dentry_count(&self) -> usize {
        self.dentries.len()
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Looks up a child of `parent` by exact name.
    pub fn child_by_name(&self, parent: DentryId, name: &str) -> Option<DentryId> {
        self.dentry(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.dentry(c).name == name)
    }

    /// Resolves a `/`- or `\`-separated path from the root.
    pub fn lookup_path(&self, path: &str) -> Option<DentryId> {
        let mut current = self.root();
        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            current = self.child_by_name(current, component)?;
        }
        Some(current)
    }

    /// The archive-side path of a dentry, for warnings and progress.
    pub fn source_path(&self, id: DentryId) -> String {
        let mut components = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let dentry = self.dentry(c);
            if dentry.parent.is_some() {
                components.push(dentry.name.to_string_lossy());
            }
            current = dentry.parent;
        }
        if components.is_empty() {
            return "/".to_string();
        }
        components.reverse();
        let mut path = String::new();
        for component in components {
            path.push('/');
            path.push_str(&component);
        }
        path
    }

    /// Preorder traversal of the subtree rooted at `root`: parents before
    /// children.
    pub fn preorder(&self, root: DentryId) -> Preorder<'_> {
        Preorder {
            tree: self,
            stack: vec![root],
        }
    }

    /// Postorder traversal of the subtree rooted at `root`: children before
    /// parents.
    pub fn postorder(&self, root: DentryId) -> Postorder<'_> {
        Postorder {
            tree: self,
            stack: vec![(root, 0)],
        }
    }

    /// Clears every per-extraction scratch field, making the tree reusable
    /// for another extraction.
    pub(crate) fn reset_scratch(&mut self) {
        for dentry in &mut self.dentries {
            dentry.scratch = DentryScratch::default();
        }
        for inode in &mut self.inodes {
            inode.scratch = InodeScratch::default();
        }
    }
}

/// Iterator over dentry ids in preorder.
pub struct Preorder<'a> {
    tree: &'a ImageTree,
    stack: Vec<DentryId>,
}

impl Iterator for Preorder<'_> {
    type Item = DentryId;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stack.pop()?;
        let dentry = self.tree.dentry(next);
        self.stack.extend(dentry.children.iter().rev());
        Some(next)
    }
}

/// Iterator over dentry ids in postorder.
pub struct Postorder<'a> {
    tree: &'a ImageTree,
    stack: Vec<(DentryId, usize)>,
}

impl Iterator for Postorder<'_> {
    type Item = DentryId;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (id, child_idx) = self.stack.last_mut()?;
            let children = &self.tree.dentry(*id).children;
            if *child_idx < children.len() {
                let child = children[*child_idx];
                *child_idx += 1;
                self.stack.push((child, 0));
            } else {
                let (done, _) = self.stack.pop().expect("stack is non-empty");
                return Some(done);
            }
        }
    }
}
