//! Tree nodes.

use crate::snapshot_map::EntrySize;
use bytes::Bytes;
use protocol::{Acl, Stat};
use std::collections::HashSet;

/// One node of the hierarchical tree. Children hold base names only; the
/// full child path is `"{parent}/{name}"`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub data: Bytes,
    pub acls: Vec<Acl>,
    pub stat: Stat,
    pub children: HashSet<String>,
}

impl Node {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
        self.stat.data_length = self.data.len() as i32;
    }

    pub fn add_child(&mut self, name: impl Into<String>) {
        self.children.insert(name.into());
    }

    pub fn remove_child(&mut self, name: &str) {
        self.children.remove(name);
    }

    pub fn is_ephemeral(&self) -> bool {
        self.stat.is_ephemeral()
    }
}

impl EntrySize for Node {
    fn size_in_bytes(&self) -> u64 {
        let children: u64 = self.children.iter().map(|c| c.len() as u64).sum();
        let acls: u64 = self
            .acls
            .iter()
            .map(|a| a.scheme.len() as u64 + a.id.len() as u64 + 4)
            .sum();
        self.data.len() as u64 + children + acls + std::mem::size_of::<Stat>() as u64
    }
}
