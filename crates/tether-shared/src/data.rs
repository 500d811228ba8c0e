//! Character data snapshots.
//!
//! A [`CharacterData`] is built once from a [`CharacterContent`] and never
//! mutated afterwards: its [`DataHash`] is computed at construction and
//! identifies the snapshot for deduplication. Two snapshots with the same
//! hash are treated as identical.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SharedError;

/// Kind of game object a set of replacements applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Player,
    MinionOrMount,
    Pet,
    Companion,
}

/// Content hash of a whole snapshot (hex BLAKE3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DataHash(pub String);

impl std::fmt::Display for DataHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file replacement: the game paths it covers and either the content
/// hash of the replacement file or a raw swap path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileReplacement {
    pub game_paths: BTreeSet<String>,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_swap_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triangles: Option<u64>,
}

impl FileReplacement {
    pub fn from_hash<I, S>(hash: impl Into<String>, game_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            game_paths: game_paths.into_iter().map(Into::into).collect(),
            hash: hash.into(),
            ..Default::default()
        }
    }

    pub fn from_swap<I, S>(swap_path: impl Into<String>, game_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            game_paths: game_paths.into_iter().map(Into::into).collect(),
            file_swap_path: Some(swap_path.into()),
            ..Default::default()
        }
    }

    /// Swaps point at another game file and carry no uploadable content.
    pub fn is_file_swap(&self) -> bool {
        self.file_swap_path
            .as_deref()
            .is_some_and(|p| !p.is_empty())
    }
}

/// Everything a snapshot carries besides its hash.
///
/// The string blobs are appearance state owned by other tools and are
/// forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CharacterContent {
    #[serde(default)]
    pub file_replacements: BTreeMap<ObjectKind, Vec<FileReplacement>>,
    #[serde(default)]
    pub glamourer_data: BTreeMap<ObjectKind, String>,
    #[serde(default)]
    pub customize_plus_data: BTreeMap<ObjectKind, String>,
    #[serde(default)]
    pub manipulation_data: String,
    #[serde(default)]
    pub heels_data: String,
    #[serde(default)]
    pub honorific_data: String,
    #[serde(default)]
    pub moodles_data: String,
    #[serde(default)]
    pub pet_names_data: String,
}

/// An immutable, hash-identified character data snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CharacterData {
    data_hash: DataHash,
    #[serde(flatten)]
    content: CharacterContent,
}

impl CharacterData {
    pub fn from_content(content: CharacterContent) -> Result<Self, SharedError> {
        let canonical = serde_json::to_vec(&content)?;
        let data_hash = DataHash(blake3::hash(&canonical).to_hex().to_string());
        Ok(Self { data_hash, content })
    }

    pub fn data_hash(&self) -> &DataHash {
        &self.data_hash
    }

    pub fn content(&self) -> &CharacterContent {
        &self.content
    }

    pub fn file_replacements(&self) -> &BTreeMap<ObjectKind, Vec<FileReplacement>> {
        &self.content.file_replacements
    }

    /// Distinct content hashes referenced by non-swap replacements.
    pub fn referenced_hashes(&self) -> BTreeSet<String> {
        self.content
            .file_replacements
            .values()
            .flatten()
            .filter(|r| !r.is_file_swap() && !r.hash.is_empty())
            .map(|r| r.hash.clone())
            .collect()
    }

    /// Copy of this snapshot with every replacement whose hash is in
    /// `hashes` removed. Hash comparison ignores ASCII case.
    ///
    /// The copy keeps this snapshot's [`DataHash`]: it is the same
    /// logical snapshot with some content omitted.
    pub fn without_hashes(&self, hashes: &HashSet<String>) -> Self {
        if hashes.is_empty() {
            return self.clone();
        }
        let lowered: HashSet<String> = hashes.iter().map(|h| h.to_ascii_lowercase()).collect();
        let mut content = self.content.clone();
        for replacements in content.file_replacements.values_mut() {
            replacements.retain(|r| r.is_file_swap() || !lowered.contains(&r.hash.to_ascii_lowercase()));
        }
        Self {
            data_hash: self.data_hash.clone(),
            content,
        }
    }

    /// Sum of precomputed VRAM cost over the player's replacements.
    pub fn player_vram_bytes(&self) -> u64 {
        self.player_replacements()
            .filter_map(|r| r.vram_bytes)
            .sum()
    }

    /// Sum of precomputed triangle counts over the player's replacements.
    pub fn player_triangles(&self) -> u64 {
        self.player_replacements()
            .filter_map(|r| r.triangles)
            .sum()
    }

    fn player_replacements(&self) -> impl Iterator<Item = &FileReplacement> {
        self.content
            .file_replacements
            .get(&ObjectKind::Player)
            .into_iter()
            .flatten()
    }
}
