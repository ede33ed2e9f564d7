//! The frozen build DAG, as emitted by the frontend.
//!
//! Everything in here is read-only while a build runs.  The DAG file carries
//! a magic number at both ends so a truncated write is caught at load, a
//! hashed identifier naming the frontend invocation that produced it, and
//! signature records the driver validates before trusting the graph.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::densemap;
use crate::hash::{djb2_hash_path, HashDigest, HashState};

/// Index of a node within the frozen DAG (not the live node-state array).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u)
    }
}

/// 16-byte node identity computed by the frontend from the node's outputs
/// (or action+inputs+annotation for output-less nodes).  The DAG and the
/// persisted state are both sorted by it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(hex: &str) -> Option<Guid> {
        if hex.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Guid(out))
    }

    /// Replicates the frontend's GUID rule; used by DAG-producing tests and
    /// tools, never by the build core itself.
    pub fn for_node(node: &NodeData) -> Guid {
        let mut h = HashState::new();
        if node.output_files.is_empty() {
            h.add_string(&node.action);
            h.add_separator();
            h.add_string(&node.annotation);
            h.add_separator();
            for input in &node.input_files {
                h.add_path(&input.path);
                h.add_separator();
            }
        } else {
            for output in &node.output_files {
                h.add_path(&output.path);
                h.add_separator();
            }
        }
        let digest = h.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.0[..16]);
        Guid(out)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.to_hex())
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Guid::from_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("bad guid {:?}", s)))
    }
}

/// A file path plus its DJB2 path hash.  The frontend precomputes hashes;
/// anything constructed at runtime goes through `FileAndHash::new`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAndHash {
    pub path: String,
    #[serde(default)]
    pub path_hash: u32,
}

impl FileAndHash {
    pub fn new(path: impl Into<String>) -> FileAndHash {
        let path = path.into();
        let path_hash = djb2_hash_path(&path);
        FileAndHash { path, path_hash }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Node behavior flags, stored as a bit set to match the frozen format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeFlags(pub u32);

impl NodeFlags {
    /// Safe to overwrite output files in place.  Without this flag outputs
    /// are removed before the action runs; some tools misbehave in the
    /// presence of stale outputs (ar is the classic example).
    pub const OVERWRITE_OUTPUTS: u32 = 1 << 0;
    /// Keep output files even if the build fails, e.g. incremental link state.
    pub const PRECIOUS_OUTPUTS: u32 = 1 << 1;
    /// Consumes one of the limited "expensive" slots while running.
    pub const EXPENSIVE: u32 = 1 << 2;
    /// If not set, any console output not covered by the allowed substrings
    /// fails the node.
    pub const ALLOW_UNEXPECTED_OUTPUT: u32 = 1 << 3;
    /// The action text is file content to write, not a command to run.
    pub const WRITE_TEXT_FILE: u32 = 1 << 4;
    /// Skip the untouched-output check after the action runs.
    pub const ALLOW_UNWRITTEN_OUTPUT_FILES: u32 = 1 << 5;
    /// Sign inputs by timestamp even when their extension is digest-signed.
    pub const BAN_CONTENT_DIGEST_FOR_INPUTS: u32 = 1 << 6;

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn overwrite_outputs(self) -> bool {
        self.has(Self::OVERWRITE_OUTPUTS)
    }
    pub fn precious_outputs(self) -> bool {
        self.has(Self::PRECIOUS_OUTPUTS)
    }
    pub fn expensive(self) -> bool {
        self.has(Self::EXPENSIVE)
    }
    pub fn allow_unexpected_output(self) -> bool {
        self.has(Self::ALLOW_UNEXPECTED_OUTPUT)
    }
    pub fn write_text_file(self) -> bool {
        self.has(Self::WRITE_TEXT_FILE)
    }
    pub fn allow_unwritten_output_files(self) -> bool {
        self.has(Self::ALLOW_UNWRITTEN_OUTPUT_FILES)
    }
    pub fn ban_content_digest_for_inputs(self) -> bool {
        self.has(Self::BAN_CONTENT_DIGEST_FOR_INPUTS)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerKind {
    Cpp,
    Generic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScannerKeyword {
    pub word: String,
    /// Whether files referenced via this keyword are themselves scanned.
    pub should_follow: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub kind: ScannerKind,
    #[serde(default)]
    pub include_paths: Vec<String>,
    /// Identity of this scanner configuration; scan cache entries key on it.
    pub guid: Guid,
    #[serde(default)]
    pub require_whitespace: bool,
    #[serde(default)]
    pub bare_means_system: bool,
    #[serde(default)]
    pub keywords: Vec<ScannerKeyword>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SharedResourceData {
    pub annotation: String,
    #[serde(default)]
    pub create_action: Option<String>,
    #[serde(default)]
    pub destroy_action: Option<String>,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeData {
    pub action: String,
    #[serde(default)]
    pub pre_action: Option<String>,
    pub annotation: String,
    #[serde(default)]
    pub pass_index: u32,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    /// Reverse of dependencies, precomputed by the frontend.
    #[serde(default)]
    pub back_links: Vec<u32>,
    #[serde(default)]
    pub input_files: Vec<FileAndHash>,
    #[serde(default)]
    pub output_files: Vec<FileAndHash>,
    #[serde(default)]
    pub aux_output_files: Vec<FileAndHash>,
    #[serde(default)]
    pub allowed_output_substrings: Vec<String>,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub scanner: Option<ScannerConfig>,
    #[serde(default)]
    pub shared_resources: Vec<u32>,
    #[serde(default)]
    pub flags: NodeFlags,
    pub original_index: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassData {
    pub name: String,
}

/// A file whose timestamp the DAG was generated against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DagFileSignature {
    pub path: String,
    pub timestamp: u64,
}

/// A directory listing digest the DAG was generated against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DagGlobSignature {
    pub path: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub recurse: bool,
    pub digest: HashDigest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DagData {
    pub magic: u32,
    /// Hash of the frontend invocation identity; persisted state records
    /// which identifiers each node has been seen under.
    pub hashed_identifier: u32,
    /// Sorted ascending; node_guids[i] identifies nodes[i].
    pub node_guids: Vec<Guid>,
    pub nodes: Vec<NodeData>,
    #[serde(default)]
    pub passes: Vec<PassData>,
    #[serde(default)]
    pub shared_resources: Vec<SharedResourceData>,
    #[serde(default)]
    pub file_signatures: Vec<DagFileSignature>,
    #[serde(default)]
    pub glob_signatures: Vec<DagGlobSignature>,
    /// DJB2 hashes of filename extensions whose files are signed by content
    /// digest rather than timestamp.
    #[serde(default)]
    pub content_digest_extensions: Vec<u32>,
    #[serde(default)]
    pub max_expensive_count: i32,
    #[serde(default)]
    pub days_to_keep_unreferenced_nodes: u32,
    pub state_filename: String,
    pub state_filename_tmp: String,
    pub scan_cache_filename: String,
    pub scan_cache_filename_tmp: String,
    pub digest_cache_filename: String,
    pub digest_cache_filename_tmp: String,
    #[serde(default)]
    pub structured_log_filename: Option<String>,
    #[serde(default)]
    pub build_title: String,
    pub magic_end: u32,
}

impl DagData {
    pub const MAGIC: u32 = 0x2b89_014f;

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    pub fn guid(&self, id: NodeId) -> &Guid {
        &self.node_guids[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
