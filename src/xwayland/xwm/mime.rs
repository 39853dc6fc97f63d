//! Mapping between X11 selection targets and MIME types
//!
//! X11 clients negotiate data formats through atoms. Modern toolkits use atoms named after MIME types,
//! while legacy clients use a few well-known atoms like `UTF8_STRING` or `STRING`. Several atoms may
//! stand for the same MIME type, and for outbound offers one canonical atom per MIME type is used.

use std::collections::HashMap;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace};
use x11rb::{
    errors::ReplyOrIdError,
    protocol::xproto::{Atom, AtomEnum},
};

use super::{connection::XConnection, Atoms};

/// MIME type of UTF-8 encoded plain text
pub const TEXT_PLAIN_UTF8: &str = "text/plain;charset=utf-8";
/// MIME type of plain text in an unspecified encoding
pub const TEXT_PLAIN: &str = "text/plain";

// (alias, canonical)
const MIME_ALIASES: &[(&str, &str)] = &[("text/x-uri", "text/uri-list")];

fn canonical_mime(mime_type: &str) -> &str {
    MIME_ALIASES
        .iter()
        .find(|(alias, _)| *alias == mime_type)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(mime_type)
}

/// A MIME type together with one of the atoms standing for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeAtom {
    /// The MIME type
    pub id: String,
    /// The X11 atom
    pub atom: Atom,
}

/// The ordered set of types advertised for a selection, unique by atom
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferSet(IndexMap<Atom, String>);

impl OfferSet {
    /// Create an empty offer set
    pub fn new() -> Self {
        OfferSet::default()
    }

    /// Add an entry, returns `false` if the atom was already part of the set
    pub fn insert(&mut self, mime: MimeAtom) -> bool {
        if self.0.contains_key(&mime.atom) {
            return false;
        }
        self.0.insert(mime.atom, mime.id);
        true
    }

    /// The MIME types of this set, deduplicated, in advertisement order
    pub fn mime_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(self.0.len());
        for id in self.0.values() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// The first advertised atom standing for `mime_type`
    pub fn find_mime(&self, mime_type: &str) -> Option<Atom> {
        let mime_type = canonical_mime(mime_type);
        self.0
            .iter()
            .find(|(_, id)| id.as_str() == mime_type)
            .map(|(atom, _)| *atom)
    }

    /// MIME types `(added, removed)` when going from `previous` to this set
    pub fn diff(&self, previous: &OfferSet) -> (Vec<String>, Vec<String>) {
        let current = self.mime_ids();
        let previous = previous.mime_ids();
        let added = current.iter().filter(|id| !previous.contains(id)).cloned().collect();
        let removed = previous.into_iter().filter(|id| !current.contains(id)).collect();
        (added, removed)
    }
}

/// Caching, bidirectional table between atoms and MIME types
#[derive(Debug)]
pub struct MimeTable {
    atoms: Atoms,
    by_mime: HashMap<String, SmallVec<[Atom; 3]>>,
    by_atom: HashMap<Atom, Option<String>>,
}

impl MimeTable {
    /// Create a table seeded with the legacy text atoms
    pub fn new(atoms: &Atoms) -> MimeTable {
        let mut by_atom = HashMap::new();
        by_atom.insert(atoms.UTF8_STRING, Some(TEXT_PLAIN_UTF8.to_owned()));
        by_atom.insert(atoms.TEXT, Some(TEXT_PLAIN.to_owned()));
        by_atom.insert(atoms.STRING, Some(TEXT_PLAIN.to_owned()));
        // protocol targets, never data
        for atom in [
            AtomEnum::NONE.into(),
            atoms.TARGETS,
            atoms.TIMESTAMP,
            atoms.MULTIPLE,
            atoms.SAVE_TARGETS,
            atoms.DELETE,
            atoms.INCR,
        ] {
            by_atom.insert(atom, None);
        }

        MimeTable {
            atoms: *atoms,
            by_mime: HashMap::new(),
            by_atom,
        }
    }

    /// All atoms standing for `mime_type`, canonical atom first
    pub fn atoms_for(
        &mut self,
        conn: &dyn XConnection,
        mime_type: &str,
    ) -> Result<SmallVec<[Atom; 3]>, ReplyOrIdError> {
        let mime_type = canonical_mime(mime_type);
        if let Some(atoms) = self.by_mime.get(mime_type) {
            return Ok(atoms.clone());
        }

        let mut atoms = SmallVec::<[Atom; 3]>::new();
        match mime_type {
            TEXT_PLAIN_UTF8 => atoms.push(self.atoms.UTF8_STRING),
            TEXT_PLAIN => {
                atoms.push(self.atoms.TEXT);
                atoms.push(self.atoms.STRING);
            }
            _ => {}
        }
        let named = conn.intern_atom(mime_type)?;
        if !atoms.contains(&named) {
            atoms.push(named);
        }
        self.by_atom
            .entry(named)
            .or_insert_with(|| Some(mime_type.to_owned()));

        trace!(mime_type, ?atoms, "Resolved mime type");
        self.by_mime.insert(mime_type.to_owned(), atoms.clone());
        Ok(atoms)
    }

    /// The atom used to advertise `mime_type`
    pub fn canonical_atom(&mut self, conn: &dyn XConnection, mime_type: &str) -> Result<Atom, ReplyOrIdError> {
        let atoms = self.atoms_for(conn, mime_type)?;
        Ok(atoms.first().copied().unwrap_or(AtomEnum::NONE.into()))
    }

    /// The MIME type an atom stands for
    ///
    /// Returns `None` for protocol atoms, for names not looking like a MIME type and if the name
    /// cannot be resolved.
    pub fn mime_for(&mut self, conn: &dyn XConnection, atom: Atom) -> Option<String> {
        if let Some(mime_type) = self.by_atom.get(&atom) {
            return mime_type.clone();
        }

        let mime_type = match conn.atom_name(atom) {
            Ok(name) if name.contains('/') => Some(canonical_mime(&name).to_owned()),
            Ok(name) => {
                trace!(atom, name, "Atom is not a mime type");
                None
            }
            Err(err) => {
                debug!(atom, ?err, "Failed to resolve atom name");
                None
            }
        };
        self.by_atom.insert(atom, mime_type.clone());
        mime_type
    }

    /// Decode a list of offered atoms, skipping every atom without a MIME type
    pub fn offer_set(&mut self, conn: &dyn XConnection, atoms: impl IntoIterator<Item = Atom>) -> OfferSet {
        let mut offers = OfferSet::new();
        for atom in atoms {
            if let Some(id) = self.mime_for(conn, atom) {
                offers.insert(MimeAtom { id, atom });
            }
        }
        offers
    }
}
