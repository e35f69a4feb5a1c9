//! Flat device trees and the live node/property graph.
//!
//! The firmware hands over flattened trees (FDT); the hypervisor
//! unflattens them into an arena-backed graph, works on that, and
//! flattens generated guest trees back out. Nodes are addressed by
//! `NodeId` into the arena; removed nodes stay allocated but detached,
//! so stale ids never alias a different node.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::Write;

use crate::errors::{Error, Result};

pub const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
const FDT_HEADER_SIZE: usize = 40;

pub const MAX_DT_PATH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone)]
pub struct DtProp {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct DtNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub props: Vec<DtProp>,
    detached: bool,
}

/// A live device tree: arena of nodes rooted at node 0.
pub struct DeviceTree {
    nodes: Vec<DtNode>,
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTree {
    /// An empty tree with an unnamed root.
    pub fn new() -> Self {
        DeviceTree {
            nodes: alloc::vec![DtNode {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                props: Vec::new(),
                detached: false,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &DtNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut DtNode {
        &mut self.nodes[id.0]
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    // ── construction ────────────────────────────────────────────────

    pub fn add_node(&mut self, parent: NodeId, name: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(DtNode {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            props: Vec::new(),
            detached: false,
        });
        self.node_mut(parent).children.push(id);
        id
    }

    /// Detach a node (and transitively its children) from the tree.
    pub fn remove_node(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.node_mut(parent).children.retain(|&c| c != id);
        }
        let mut stack = alloc::vec![id];
        while let Some(n) = stack.pop() {
            self.nodes[n.0].detached = true;
            stack.extend_from_slice(&self.nodes[n.0].children);
        }
    }

    /// Find a direct subnode by name, optionally creating it.
    pub fn get_subnode(&mut self, id: NodeId, name: &str, create: bool) -> Option<NodeId> {
        if let Some(found) = self.subnode(id, name) {
            return Some(found);
        }
        if create {
            Some(self.add_node(id, name))
        } else {
            None
        }
    }

    pub fn subnode(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[id.0].children.iter().copied().find(|&c| self.nodes[c.0].name == name)
    }

    // ── properties ──────────────────────────────────────────────────

    pub fn get_prop(&self, id: NodeId, name: &str) -> Option<&[u8]> {
        self.nodes[id.0].props.iter().find(|p| p.name == name).map(|p| p.data.as_slice())
    }

    pub fn get_prop_u32(&self, id: NodeId, name: &str) -> Option<u32> {
        let data = self.get_prop(id, name)?;
        if data.len() != 4 {
            return None;
        }
        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub fn get_prop_str(&self, id: NodeId, name: &str) -> Option<&str> {
        let data = self.get_prop(id, name)?;
        let data = data.strip_suffix(&[0u8])?;
        core::str::from_utf8(data).ok()
    }

    pub fn set_prop(&mut self, id: NodeId, name: &str, data: &[u8]) {
        let node = self.node_mut(id);
        if let Some(p) = node.props.iter_mut().find(|p| p.name == name) {
            p.data = data.to_vec();
        } else {
            node.props.push(DtProp { name: name.to_string(), data: data.to_vec() });
        }
    }

    pub fn set_prop_u32(&mut self, id: NodeId, name: &str, value: u32) {
        self.set_prop(id, name, &value.to_be_bytes());
    }

    /// Cells are stored big-endian, one u32 per cell.
    pub fn set_prop_cells(&mut self, id: NodeId, name: &str, cells: &[u32]) {
        let mut data = Vec::with_capacity(cells.len() * 4);
        for c in cells {
            data.extend_from_slice(&c.to_be_bytes());
        }
        self.set_prop(id, name, &data);
    }

    pub fn set_prop_str(&mut self, id: NodeId, name: &str, value: &str) {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.set_prop(id, name, &data);
    }

    pub fn delete_prop(&mut self, id: NodeId, name: &str) {
        self.node_mut(id).props.retain(|p| p.name != name);
    }

    // ── lookup ──────────────────────────────────────────────────────

    /// Depth-first traversal of the attached tree under `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = alloc::vec![id];
        while let Some(n) = stack.pop() {
            if self.nodes[n.0].detached {
                continue;
            }
            out.push(n);
            for &c in self.nodes[n.0].children.iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    /// Does the node's `compatible` string list contain `compat`?
    pub fn is_compatible(&self, id: NodeId, compat: &str) -> bool {
        match self.get_prop(id, "compatible") {
            Some(data) => data.split(|&b| b == 0).any(|s| s == compat.as_bytes()),
            None => false,
        }
    }

    pub fn find_compatible(&self, compat: &str) -> Vec<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|&n| self.is_compatible(n, compat))
            .collect()
    }

    pub fn phandle(&self, id: NodeId) -> Option<u32> {
        self.get_prop_u32(id, "phandle").or_else(|| self.get_prop_u32(id, "linux,phandle"))
    }

    pub fn lookup_phandle(&self, phandle: u32) -> Option<NodeId> {
        self.descendants(self.root()).into_iter().find(|&n| self.phandle(n) == Some(phandle))
    }

    /// Allocate a phandle greater than any already present and stamp it
    /// onto the node under both property names.
    pub fn assign_phandle(&mut self, id: NodeId) -> u32 {
        if let Some(ph) = self.phandle(id) {
            return ph;
        }
        let next = self
            .descendants(self.root())
            .into_iter()
            .filter_map(|n| self.phandle(n))
            .max()
            .unwrap_or(0)
            + 1;
        self.set_prop_u32(id, "phandle", next);
        self.set_prop_u32(id, "linux,phandle", next);
        next
    }

    pub fn path(&self, id: NodeId) -> String {
        if self.nodes[id.0].parent.is_none() {
            return "/".to_string();
        }
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            if self.nodes[n.0].parent.is_some() {
                parts.push(self.nodes[n.0].name.as_str());
            }
            cur = self.nodes[n.0].parent;
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        path
    }

    /// Resolve an absolute path, or an alias from `/aliases`.
    pub fn lookup(&self, path_or_alias: &str) -> Option<NodeId> {
        let path = if path_or_alias.starts_with('/') {
            path_or_alias.to_string()
        } else {
            let aliases = self.subnode(self.root(), "aliases")?;
            self.get_prop_str(aliases, path_or_alias)?.to_string()
        };

        let mut cur = self.root();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = self.subnode(cur, part)?;
        }
        Some(cur)
    }

    /// Record an alias for `target` in `/aliases`.
    pub fn create_alias(&mut self, name: &str, target: NodeId) {
        let path = self.path(target);
        let root = self.root();
        let aliases = match self.subnode(root, "aliases") {
            Some(n) => n,
            None => self.add_node(root, "aliases"),
        };
        self.set_prop_str(aliases, name, &path);
    }

    // ── merge ───────────────────────────────────────────────────────

    /// Merge `src` (from another tree) into `dest`: properties
    /// overwrite, children merge recursively by name. With `deletion`
    /// set, `delete-prop` / `delete-node` string lists in `src` delete
    /// from `dest` instead of being copied.
    pub fn merge(&mut self, dest: NodeId, src_tree: &DeviceTree, src: NodeId, deletion: bool) {
        if deletion {
            if let Some(data) = src_tree.get_prop(src, "delete-prop") {
                for name in strlist(data) {
                    self.delete_prop(dest, name);
                }
            }
            if let Some(data) = src_tree.get_prop(src, "delete-node") {
                for name in strlist(data) {
                    if let Some(victim) = self.subnode(dest, name) {
                        self.remove_node(victim);
                    }
                }
            }
        }

        for prop in &src_tree.node(src).props {
            if deletion && (prop.name == "delete-prop" || prop.name == "delete-node") {
                continue;
            }
            self.set_prop(dest, &prop.name, &prop.data);
        }

        for &child in &src_tree.node(src).children {
            if src_tree.node(child).detached {
                continue;
            }
            let name = src_tree.node(child).name.clone();
            let dchild = match self.subnode(dest, &name) {
                Some(n) => n,
                None => self.add_node(dest, &name),
            };
            self.merge(dchild, src_tree, child, deletion);
        }
    }

    // ── flattened form ──────────────────────────────────────────────

    /// Unflatten an FDT blob into a live tree.
    pub fn parse(blob: &[u8]) -> Result<DeviceTree> {
        if blob.len() < FDT_HEADER_SIZE {
            return Err(Error::BadTree);
        }
        let magic = be32(blob, 0)?;
        if magic != FDT_MAGIC {
            return Err(Error::BadTree);
        }
        let totalsize = be32(blob, 4)? as usize;
        let off_struct = be32(blob, 8)? as usize;
        let off_strings = be32(blob, 12)? as usize;
        if totalsize > blob.len() || off_struct >= totalsize || off_strings >= totalsize {
            return Err(Error::BadTree);
        }

        let mut tree = DeviceTree::new();
        let mut stack: Vec<NodeId> = Vec::new();
        let mut off = off_struct;
        let mut seen_root = false;

        loop {
            let token = be32(blob, off)?;
            off += 4;

            match token {
                FDT_BEGIN_NODE => {
                    let name = cstr(blob, off)?;
                    off = align4(off + name.len() + 1);

                    if stack.is_empty() {
                        if seen_root {
                            return Err(Error::BadTree);
                        }
                        seen_root = true;
                        stack.push(tree.root());
                    } else {
                        let parent = *stack.last().ok_or(Error::BadTree)?;
                        let id = tree.add_node(parent, name);
                        stack.push(id);
                    }
                }
                FDT_END_NODE => {
                    stack.pop().ok_or(Error::BadTree)?;
                }
                FDT_PROP => {
                    let len = be32(blob, off)? as usize;
                    let nameoff = be32(blob, off + 4)? as usize;
                    off += 8;
                    let data = blob.get(off..off + len).ok_or(Error::BadTree)?.to_vec();
                    off = align4(off + len);

                    let name = cstr(blob, off_strings + nameoff)?;
                    let node = *stack.last().ok_or(Error::BadTree)?;
                    tree.node_mut(node).props.push(DtProp { name: name.to_string(), data });
                }
                FDT_NOP => {}
                FDT_END => {
                    if !stack.is_empty() || !seen_root {
                        return Err(Error::BadTree);
                    }
                    return Ok(tree);
                }
                _ => return Err(Error::BadTree),
            }
        }
    }

    /// Flatten the tree back into FDT form.
    pub fn flatten(&self) -> Vec<u8> {
        let mut strings: Vec<u8> = Vec::new();
        let mut structure: Vec<u8> = Vec::new();

        self.flatten_node(self.root(), &mut structure, &mut strings);
        structure.extend_from_slice(&FDT_END.to_be_bytes());

        let off_struct = FDT_HEADER_SIZE + 16; // empty memreserve map (one null entry)
        let off_strings = off_struct + structure.len();
        let totalsize = off_strings + strings.len();

        let mut out = Vec::with_capacity(totalsize);
        for word in [
            FDT_MAGIC,
            totalsize as u32,
            off_struct as u32,
            off_strings as u32,
            FDT_HEADER_SIZE as u32, // off_mem_rsvmap
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            0, // boot_cpuid_phys
            strings.len() as u32,
            structure.len() as u32,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; 16]); // memreserve terminator
        out.extend_from_slice(&structure);
        out.extend_from_slice(&strings);
        out
    }

    fn flatten_node(&self, id: NodeId, structure: &mut Vec<u8>, strings: &mut Vec<u8>) {
        let node = &self.nodes[id.0];
        structure.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        structure.extend_from_slice(node.name.as_bytes());
        structure.push(0);
        pad4(structure);

        for prop in &node.props {
            let nameoff = string_offset(strings, &prop.name);
            structure.extend_from_slice(&FDT_PROP.to_be_bytes());
            structure.extend_from_slice(&(prop.data.len() as u32).to_be_bytes());
            structure.extend_from_slice(&(nameoff as u32).to_be_bytes());
            structure.extend_from_slice(&prop.data);
            pad4(structure);
        }

        for &child in &node.children {
            if !self.nodes[child.0].detached {
                self.flatten_node(child, structure, strings);
            }
        }

        structure.extend_from_slice(&FDT_END_NODE.to_be_bytes());
    }

    // ── printing ────────────────────────────────────────────────────

    /// Render the tree in source form (shell `print` commands).
    pub fn print(&self, id: NodeId, out: &mut String) {
        self.print_node(id, 0, out);
    }

    fn print_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let node = &self.nodes[id.0];
        indent(out, depth);
        if node.parent.is_none() {
            out.push_str("/ {\n");
        } else {
            let _ = writeln!(out, "{} {{", node.name);
        }

        for prop in &node.props {
            indent(out, depth + 1);
            if prop.data.is_empty() {
                let _ = writeln!(out, "{};", prop.name);
            } else if is_strlist(&prop.data) {
                let _ = write!(out, "{} = ", prop.name);
                for (i, s) in strlist(&prop.data).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "\"{}\"", s);
                }
                out.push_str(";\n");
            } else if prop.data.len() % 4 == 0 {
                let _ = write!(out, "{} = <", prop.name);
                for (i, chunk) in prop.data.chunks(4).enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    let v = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let _ = write!(out, "{:#x}", v);
                }
                out.push_str(">;\n");
            } else {
                let _ = write!(out, "{} = [", prop.name);
                for (i, b) in prop.data.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    let _ = write!(out, "{:02x}", b);
                }
                out.push_str("];\n");
            }
        }

        for &child in &node.children {
            if !self.nodes[child.0].detached {
                self.print_node(child, depth + 1, out);
            }
        }

        indent(out, depth);
        out.push_str("};\n");
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn be32(blob: &[u8], off: usize) -> Result<u32> {
    let bytes = blob.get(off..off + 4).ok_or(Error::BadTree)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn cstr(blob: &[u8], off: usize) -> Result<&str> {
    let rest = blob.get(off..).ok_or(Error::BadTree)?;
    let end = rest.iter().position(|&b| b == 0).ok_or(Error::BadTree)?;
    core::str::from_utf8(&rest[..end]).map_err(|_| Error::BadTree)
}

const fn align4(off: usize) -> usize {
    (off + 3) & !3
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn string_offset(strings: &mut Vec<u8>, name: &str) -> usize {
    // reuse an existing identical string if present
    let needle = name.as_bytes();
    let mut off = 0;
    while off < strings.len() {
        let end = strings[off..].iter().position(|&b| b == 0).map(|p| off + p);
        match end {
            Some(end) if &strings[off..end] == needle => return off,
            Some(end) => off = end + 1,
            None => break,
        }
    }
    let result = strings.len();
    strings.extend_from_slice(needle);
    strings.push(0);
    result
}

/// Is this property plausibly a list of printable strings?
fn is_strlist(data: &[u8]) -> bool {
    if !matches!(data.last(), Some(0)) {
        return false;
    }
    let mut last_was_nul = true;
    for &b in data {
        if b == 0 {
            if last_was_nul {
                return false;
            }
            last_was_nul = true;
        } else if !(0x20..0x7f).contains(&b) {
            return false;
        } else {
            last_was_nul = false;
        }
    }
    true
}

/// Iterate the strings of a nul-separated string-list property.
pub fn strlist(data: &[u8]) -> impl Iterator<Item = &str> {
    data.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .filter_map(|s| core::str::from_utf8(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> DeviceTree {
        let mut t = DeviceTree::new();
        let root = t.root();
        t.set_prop_str(root, "compatible", "fsl,hv-config");

        let part = t.add_node(root, "part1");
        t.set_prop_str(part, "compatible", "partition");
        t.set_prop_cells(part, "cpus", &[0, 2]);

        let bc = t.add_node(part, "bc0");
        t.set_prop_str(bc, "compatible", "byte-channel");
        t.set_prop_u32(bc, "phandle", 7);
        t
    }

    #[test]
    fn test_flatten_parse_roundtrip() {
        let t = sample_tree();
        let blob = t.flatten();
        let t2 = DeviceTree::parse(&blob).expect("parse");

        let part = t2.subnode(t2.root(), "part1").expect("part1");
        assert!(t2.is_compatible(part, "partition"));
        assert_eq!(t2.get_prop(part, "cpus").unwrap(), &[0, 0, 0, 0, 0, 0, 0, 2]);

        let bc = t2.subnode(part, "bc0").expect("bc0");
        assert_eq!(t2.phandle(bc), Some(7));
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut blob = sample_tree().flatten();
        blob[0] = 0;
        assert_eq!(DeviceTree::parse(&blob).err(), Some(Error::BadTree));
    }

    #[test]
    fn test_lookup_phandle_and_path() {
        let t = sample_tree();
        let bc = t.lookup_phandle(7).expect("phandle 7");
        assert_eq!(t.path(bc), "/part1/bc0");
        assert_eq!(t.lookup("/part1/bc0"), Some(bc));
        assert_eq!(t.lookup("/part1/nope"), None);
    }

    #[test]
    fn test_aliases() {
        let mut t = sample_tree();
        let bc = t.lookup_phandle(7).unwrap();
        t.create_alias("bc0", bc);
        assert_eq!(t.lookup("bc0"), Some(bc));
    }

    #[test]
    fn test_find_compatible() {
        let t = sample_tree();
        assert_eq!(t.find_compatible("byte-channel").len(), 1);
        assert_eq!(t.find_compatible("partition").len(), 1);
        assert_eq!(t.find_compatible("nothing").len(), 0);
    }

    #[test]
    fn test_compatible_string_list() {
        let mut t = DeviceTree::new();
        let n = t.add_node(t.root(), "uart");
        t.set_prop(n, "compatible", b"fsl,ns16550\0ns16550\0");
        assert!(t.is_compatible(n, "ns16550"));
        assert!(t.is_compatible(n, "fsl,ns16550"));
        assert!(!t.is_compatible(n, "ns1655"));
    }

    #[test]
    fn test_merge_overwrites_and_recurses() {
        let mut dest = sample_tree();
        let mut src = DeviceTree::new();
        let spart = src.add_node(src.root(), "part1");
        src.set_prop_str(spart, "label", "updated");
        let extra = src.add_node(spart, "extra");
        src.set_prop_u32(extra, "reg", 5);

        let droot = dest.root();
        dest.merge(droot, &src, src.root(), false);

        let part = dest.subnode(dest.root(), "part1").unwrap();
        assert_eq!(dest.get_prop_str(part, "label"), Some("updated"));
        let extra = dest.subnode(part, "extra").unwrap();
        assert_eq!(dest.get_prop_u32(extra, "reg"), Some(5));
    }

    #[test]
    fn test_merge_deletion() {
        let mut dest = sample_tree();
        let mut src = DeviceTree::new();
        let spart = src.add_node(src.root(), "part1");
        src.set_prop(spart, "delete-node", b"bc0\0");
        src.set_prop(spart, "delete-prop", b"cpus\0");

        let droot = dest.root();
        dest.merge(droot, &src, src.root(), true);

        let part = dest.subnode(dest.root(), "part1").unwrap();
        assert!(dest.get_prop(part, "cpus").is_none());
        assert!(dest.subnode(part, "bc0").is_none());
        assert!(dest.get_prop(part, "delete-node").is_none());
    }

    #[test]
    fn test_remove_node_detaches_subtree() {
        let mut t = sample_tree();
        let part = t.subnode(t.root(), "part1").unwrap();
        t.remove_node(part);
        assert!(t.subnode(t.root(), "part1").is_none());
        assert!(t.lookup_phandle(7).is_none());
    }

    #[test]
    fn test_assign_phandle_monotonic() {
        let mut t = sample_tree();
        let part = t.subnode(t.root(), "part1").unwrap();
        let ph = t.assign_phandle(part);
        assert_eq!(ph, 8);
        // stable on reassignment
        assert_eq!(t.assign_phandle(part), 8);
    }

    #[test]
    fn test_print_forms() {
        let mut t = sample_tree();
        let part = t.subnode(t.root(), "part1").unwrap();
        t.set_prop(part, "empty", b"");
        let mut out = String::new();
        t.print(t.root(), &mut out);

        assert!(out.contains("compatible = \"partition\";"));
        assert!(out.contains("cpus = <0x0 0x2>;"));
        assert!(out.contains("empty;"));
    }
}
