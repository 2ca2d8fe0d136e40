//! In-memory catalog
//!
//! Indexed maps of every entity the orchestrator manages. The orchestrator
//! keeps one catalog behind a single mutex; all helpers here are synchronous
//! and assume the caller holds that lock.
//!
//! Operations that check the catalog, release the lock for driver and store
//! calls, and then commit, hold a [`Claim`] on the volume names they touch
//! for that whole span. A conflicting operation fails fast with
//! `InProgress` instead of committing over a stale copy.

use crate::error::{Error, Result};
use crate::model::{
    snapshot::make_snapshot_id, Backend, BackendState, Node, Snapshot, StorageClass, Volume,
    VolumePublication,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Hold on a volume name between an operation's checks and its commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// A mutation of the volume record or of its backend storage
    Exclusive(&'static str),
    /// Publishes and snapshots, which may overlap each other
    Shared(&'static str, usize),
}

impl Claim {
    fn operation(&self) -> &'static str {
        match self {
            Claim::Exclusive(operation) | Claim::Shared(operation, _) => operation,
        }
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    /// Keyed by backend UUID
    pub backends: BTreeMap<String, Backend>,
    pub volumes: BTreeMap<String, Volume>,
    pub subordinate_volumes: BTreeMap<String, Volume>,
    /// Keyed by `volume/snapshot`
    pub snapshots: BTreeMap<String, Snapshot>,
    pub nodes: BTreeMap<String, Node>,
    pub storage_classes: BTreeMap<String, StorageClass>,
    /// volume name -> node name -> publication
    pub publications: BTreeMap<String, BTreeMap<String, VolumePublication>>,
    /// Volume name -> operation in flight on it
    pub claims: BTreeMap<String, Claim>,
    /// Volume name -> backend UUID of a create or import in flight
    pub creating: BTreeMap<String, String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Backends
    // -------------------------------------------------------------------------

    pub fn backend_by_name(&self, name: &str) -> Option<&Backend> {
        self.backends.values().find(|b| b.name == name)
    }

    pub fn backend_by_name_mut(&mut self, name: &str) -> Option<&mut Backend> {
        self.backends.values_mut().find(|b| b.name == name)
    }

    pub fn backend_by_config_ref(&self, config_ref: &str) -> Option<&Backend> {
        self.backends
            .values()
            .find(|b| b.config_ref.as_deref() == Some(config_ref))
    }

    pub fn require_backend_by_name(&self, name: &str) -> Result<&Backend> {
        self.backend_by_name(name)
            .ok_or_else(|| Error::not_found("backend", name))
    }

    /// A backend holding volumes, or about to, cannot be removed yet
    pub fn backend_in_use(&self, backend_uuid: &str) -> bool {
        self.volumes
            .values()
            .chain(self.subordinate_volumes.values())
            .any(|v| v.backend_uuid == backend_uuid)
            || self.creating.values().any(|uuid| uuid == backend_uuid)
    }

    /// Record a create about to run on a backend. Backends being deleted
    /// take no new volumes.
    pub fn start_create(&mut self, volume: &str, backend_uuid: &str) -> Result<()> {
        match self.backends.get(backend_uuid) {
            Some(backend) if backend.state == BackendState::Deleting => Err(Error::FailedPrecondition(
                format!("backend {} is being deleted", backend.name),
            )),
            Some(_) => {
                self.creating.insert(volume.to_string(), backend_uuid.to_string());
                Ok(())
            }
            None => Err(Error::not_found("backend", backend_uuid)),
        }
    }

    // -------------------------------------------------------------------------
    // Claims
    // -------------------------------------------------------------------------

    /// Claim `exclusive` names for one operation and share `shared` names
    /// with other sharers. Takes nothing if any name conflicts.
    pub fn claim(&mut self, operation: &'static str, exclusive: &[&str], shared: &[&str]) -> Result<()> {
        let exclusive: BTreeSet<&str> = exclusive.iter().copied().collect();
        let shared: BTreeSet<&str> = shared.iter().copied().filter(|n| !exclusive.contains(n)).collect();

        let conflict = exclusive
            .iter()
            .filter_map(|name| self.claims.get(*name).map(|held| (*name, *held)))
            .chain(shared.iter().filter_map(|name| match self.claims.get(*name) {
                Some(held @ Claim::Exclusive(_)) => Some((*name, *held)),
                _ => None,
            }))
            .next();
        if let Some((name, held)) = conflict {
            return Err(Error::InProgress {
                operation: held.operation().to_string(),
                name: name.to_string(),
            });
        }

        for name in exclusive {
            self.claims.insert(name.to_string(), Claim::Exclusive(operation));
        }
        for name in shared {
            match self.claims.get_mut(name) {
                Some(Claim::Shared(_, holders)) => *holders += 1,
                _ => {
                    self.claims.insert(name.to_string(), Claim::Shared(operation, 1));
                }
            }
        }
        Ok(())
    }

    pub fn release(&mut self, name: &str) {
        match self.claims.get_mut(name) {
            Some(Claim::Shared(_, holders)) if *holders > 1 => *holders -= 1,
            Some(_) => {
                self.claims.remove(name);
            }
            None => {}
        }
    }

    // -------------------------------------------------------------------------
    // Volumes
    // -------------------------------------------------------------------------

    /// True if the name is taken by a volume or a subordinate volume
    pub fn volume_name_in_use(&self, name: &str) -> bool {
        self.volumes.contains_key(name) || self.subordinate_volumes.contains_key(name)
    }

    pub fn volume_or_subordinate(&self, name: &str) -> Option<&Volume> {
        self.volumes
            .get(name)
            .or_else(|| self.subordinate_volumes.get(name))
    }

    pub fn require_volume(&self, name: &str) -> Result<&Volume> {
        self.volumes
            .get(name)
            .ok_or_else(|| Error::not_found("volume", name))
    }

    /// The volume that owns backend storage for `name`: the source of a
    /// subordinate, or the volume itself
    pub fn backing_volume(&self, name: &str) -> Result<&Volume> {
        match self.subordinate_volumes.get(name) {
            Some(subordinate) => {
                let source = subordinate.config.share_source_volume.as_deref().unwrap_or_default();
                self.volumes.get(source).ok_or_else(|| {
                    Error::FailedPrecondition(format!(
                        "source volume {} of subordinate volume {} is missing",
                        source, name
                    ))
                })
            }
            None => self.require_volume(name),
        }
    }

    /// Index a persisted volume and link it to its backend
    pub fn insert_volume(&mut self, volume: Volume) {
        if volume.is_subordinate() {
            self.subordinate_volumes.insert(volume.name().to_string(), volume);
            return;
        }
        if let Some(backend) = self.backends.get_mut(&volume.backend_uuid) {
            backend.volumes.insert(volume.name().to_string());
        }
        self.volumes.insert(volume.name().to_string(), volume);
    }

    pub fn remove_volume(&mut self, name: &str) -> Option<Volume> {
        let volume = self.volumes.remove(name)?;
        if let Some(backend) = self.backends.get_mut(&volume.backend_uuid) {
            backend.volumes.remove(name);
        }
        Some(volume)
    }

    pub fn volumes_on_backend(&self, backend_uuid: &str) -> Vec<Volume> {
        self.volumes
            .values()
            .chain(self.subordinate_volumes.values())
            .filter(|v| v.backend_uuid == backend_uuid)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn snapshot(&self, volume: &str, snapshot: &str) -> Option<&Snapshot> {
        self.snapshots.get(&make_snapshot_id(volume, snapshot))
    }

    pub fn snapshots_for_volume(&self, volume: &str) -> Vec<&Snapshot> {
        self.snapshots
            .values()
            .filter(|s| s.config.volume_name == volume)
            .collect()
    }

    pub fn has_snapshots(&self, volume: &str) -> bool {
        self.snapshots.values().any(|s| s.config.volume_name == volume)
    }

    /// Volumes cloned from a given snapshot
    pub fn clones_of_snapshot(&self, volume: &str, snapshot: &str) -> Vec<&Volume> {
        self.volumes
            .values()
            .filter(|v| {
                v.config.clone_source_volume.as_deref() == Some(volume)
                    && v.config.clone_source_snapshot.as_deref() == Some(snapshot)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Publications
    // -------------------------------------------------------------------------

    pub fn publication(&self, volume: &str, node: &str) -> Option<&VolumePublication> {
        self.publications.get(volume).and_then(|by_node| by_node.get(node))
    }

    pub fn insert_publication(&mut self, publication: VolumePublication) {
        self.publications
            .entry(publication.volume_name.clone())
            .or_default()
            .insert(publication.node_name.clone(), publication);
    }

    pub fn remove_publication(&mut self, volume: &str, node: &str) -> Option<VolumePublication> {
        let by_node = self.publications.get_mut(volume)?;
        let removed = by_node.remove(node);
        if by_node.is_empty() {
            self.publications.remove(volume);
        }
        removed
    }

    pub fn publications_for_volume(&self, volume: &str) -> Vec<VolumePublication> {
        self.publications
            .get(volume)
            .map(|by_node| by_node.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn publications_for_node(&self, node: &str) -> Vec<VolumePublication> {
        self.publications
            .values()
            .filter_map(|by_node| by_node.get(node).cloned())
            .collect()
    }

    pub fn all_publications(&self) -> Vec<VolumePublication> {
        self.publications
            .values()
            .flat_map(|by_node| by_node.values().cloned())
            .collect()
    }

    /// A volume still attached to a node cannot be deleted. Fenced
    /// publications do not count.
    pub fn require_unpublished(&self, volume: &str) -> Result<()> {
        let nodes: Vec<String> = self
            .publications_for_volume(volume)
            .into_iter()
            .filter(|p| !p.unpublished)
            .map(|p| p.node_name)
            .collect();
        if nodes.is_empty() {
            return Ok(());
        }
        Err(Error::FailedPrecondition(format!(
            "volume {} is still published on {}",
            volume,
            nodes.join(", ")
        )))
    }

    /// Nodes that may be granted access on a backend
    pub fn active_nodes(&self) -> Vec<Node> {
        self.nodes.values().filter(|n| !n.deleted).cloned().collect()
    }

    /// Backend invariant: every volume on a backend points back at it
    pub fn check_backend_links(&self) -> Result<()> {
        for backend in self.backends.values() {
            for name in &backend.volumes {
                match self.volumes.get(name) {
                    Some(volume) if volume.backend_uuid == backend.uuid => {}
                    _ => {
                        return Err(Error::TypeAssertion(format!(
                            "backend {} lists volume {} which does not reference it",
                            backend.name, name
                        )))
                    }
                }
            }
        }
        for volume in self.volumes.values() {
            if let Some(backend) = self.backends.get(&volume.backend_uuid) {
                if !backend.volumes.contains(volume.name()) {
                    return Err(Error::TypeAssertion(format!(
                        "volume {} is missing from backend {}",
                        volume.name(),
                        backend.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Releases claims taken with [`Catalog::claim`] when dropped.
///
/// Build it after the lock that took the claims is released, and never let
/// it drop while that lock is held: dropping it locks the catalog.
#[must_use]
pub struct Claimed<'a> {
    catalog: &'a Mutex<Catalog>,
    names: Vec<String>,
}

impl<'a> Claimed<'a> {
    pub fn new(catalog: &'a Mutex<Catalog>, names: &[&str]) -> Self {
        let names: BTreeSet<&str> = names.iter().copied().collect();
        Self {
            catalog,
            names: names.into_iter().map(String::from).collect(),
        }
    }
}

impl Drop for Claimed<'_> {
    fn drop(&mut self) {
        let mut catalog = self.catalog.lock();
        for name in &self.names {
            catalog.release(name);
        }
    }
}
