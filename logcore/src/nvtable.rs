//! Packed name-value storage backing a `LogMessage`.
//!
//! A table is a flat `Vec<u8>` arena holding direct entries (an owned
//! name/value byte pair) and indirect entries (a typed offset into another
//! entry's value). Handles are stable 16-bit ids minted by an [`NVRegistry`]
//! shared by every table in the process; a table only ever stores *where*
//! a handle's bytes live, never the name itself for already-registered
//! handles beyond what's needed to reconstruct a direct entry's header.
//!
//! This is a from-scratch ownership-disciplined stand-in for the donor's
//! pointer-cast `struct _NVTable` overlay: offsets index into an owned
//! `Vec<u8>` instead of aliasing raw memory, so every accessor here is
//! ordinary safe Rust. The external contract — static/dynamic slots,
//! indirect one-hop resolution, `referenced`-bit rematerialization, OOM as
//! a recoverable condition rather than a panic — is preserved.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// Stable 16-bit identifier for a value name, minted by an [`NVRegistry`].
/// Handle `0` is reserved and never assigned to a real name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NVHandle(pub u16);

impl NVHandle {
    pub const NONE: NVHandle = NVHandle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

const MAX_NAME_LEN: usize = 255;
const MAX_HANDLES: usize = u16::MAX as usize;

/// Per-handle flag byte, mirrors the original's packed `LM_VF_*` bits. A
/// plain newtype rather than a `bitflags!` dependency: three bits don't earn
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleFlags(pub u8);

impl HandleFlags {
    pub const SDATA: HandleFlags = HandleFlags(0x01);
    pub const MATCH: HandleFlags = HandleFlags(0x02);
    pub const MACRO: HandleFlags = HandleFlags(0x04);

    pub const fn contains(self, other: HandleFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: HandleFlags) -> HandleFlags {
        HandleFlags(self.0 | other.0)
    }
}

struct RegistryEntry {
    name: Arc<[u8]>,
    flags: HandleFlags,
}

struct RegistryInner {
    entries: Vec<RegistryEntry>,
    by_name: HashMap<Arc<[u8]>, NVHandle>,
    num_static: u16,
}

/// Process-wide table of value names to stable handles. Append-only once a
/// name is assigned; aliases let multiple spellings resolve to one handle.
pub struct NVRegistry {
    inner: RwLock<RegistryInner>,
}

impl NVRegistry {
    /// Builds a registry pre-seeded with `static_names`, in order; these
    /// occupy handles `1..=static_names.len()` and back a table's fixed-size
    /// static offset array.
    pub fn new(static_names: &[&str]) -> Self {
        let mut entries = Vec::with_capacity(static_names.len() + 1);
        // handle 0 is NVHandle::NONE, never resolvable to a name.
        entries.push(RegistryEntry {
            name: Arc::from(&b""[..]),
            flags: HandleFlags::default(),
        });
        let mut by_name = HashMap::new();
        for name in static_names {
            let bytes: Arc<[u8]> = Arc::from(name.as_bytes());
            let handle = NVHandle(entries.len() as u16);
            by_name.insert(bytes.clone(), handle);
            entries.push(RegistryEntry {
                name: bytes,
                flags: HandleFlags::default(),
            });
        }
        let num_static = (entries.len() - 1) as u16;
        NVRegistry {
            inner: RwLock::new(RegistryInner {
                entries,
                by_name,
                num_static,
            }),
        }
    }

    pub fn num_static_entries(&self) -> u16 {
        self.inner.read().unwrap().num_static
    }

    /// Returns the handle for `name`, minting a new dynamic one on first
    /// use. Names longer than 255 bytes or a registry at the 65535-entry
    /// cap are rejected.
    pub fn get_or_assign_handle(&self, name: &[u8]) -> crate::Result<NVHandle> {
        if name.len() > MAX_NAME_LEN {
            return Err(crate::Error::NameTooLong(name.len()));
        }
        {
            let guard = self.inner.read().unwrap();
            if let Some(h) = guard.by_name.get(name) {
                return Ok(*h);
            }
        }
        let mut guard = self.inner.write().unwrap();
        // re-check under the write lock: another thread may have raced us.
        if let Some(h) = guard.by_name.get(name) {
            return Ok(*h);
        }
        if guard.entries.len() >= MAX_HANDLES {
            return Err(crate::Error::HandleSpaceExhausted);
        }
        let bytes: Arc<[u8]> = Arc::from(name);
        let handle = NVHandle(guard.entries.len() as u16);
        guard.by_name.insert(bytes.clone(), handle);
        guard.entries.push(RegistryEntry {
            name: bytes,
            flags: HandleFlags::default(),
        });
        Ok(handle)
    }

    /// Looks up a handle without allocating one if absent.
    pub fn lookup_handle(&self, name: &[u8]) -> Option<NVHandle> {
        self.inner.read().unwrap().by_name.get(name).copied()
    }

    pub fn get_name(&self, handle: NVHandle) -> Option<Arc<[u8]>> {
        let guard = self.inner.read().unwrap();
        guard.entries.get(handle.0 as usize).map(|e| e.name.clone())
    }

    pub fn add_alias(&self, handle: NVHandle, alias: &[u8]) {
        let mut guard = self.inner.write().unwrap();
        let bytes: Arc<[u8]> = Arc::from(alias);
        guard.by_name.insert(bytes, handle);
    }

    pub fn set_handle_flags(&self, handle: NVHandle, flags: HandleFlags) {
        let mut guard = self.inner.write().unwrap();
        if let Some(e) = guard.entries.get_mut(handle.0 as usize) {
            e.flags = flags;
        }
    }

    pub fn get_handle_flags(&self, handle: NVHandle) -> HandleFlags {
        self.inner
            .read()
            .unwrap()
            .entries
            .get(handle.0 as usize)
            .map(|e| e.flags)
            .unwrap_or_default()
    }
}

/// Parser/indirect-reference type tag carried by an indirect entry. Mirrors
/// the radix parser type so a captured placeholder can be stored without
/// copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NVType {
    Other = 0,
    String = 1,
    Estring = 2,
    Qstring = 3,
    Anystring = 4,
    Number = 5,
    Ipv4 = 6,
    Ipv6 = 7,
    Float = 8,
}

const FLAG_INDIRECT: u8 = 0b01;
const FLAG_REFERENCED: u8 = 0b10;

/// A packed name-value store. See the module docs for the storage scheme.
#[derive(Clone)]
pub struct NVTable {
    payload: Vec<u8>,
    max_size: usize,
    static_entries: Vec<u32>,
    dyn_entries: Vec<(NVHandle, u32)>,
    dyn_sorted: bool,
}

struct EntryView {
    indirect: bool,
    referenced: bool,
    name_len: u8,
    alloc_len: u16,
    header_len: usize,
    // direct
    value_len: u16,
    // indirect
    ref_handle: NVHandle,
    ref_ofs: u16,
    ref_len: u16,
    ref_type: u8,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    let b = v.to_le_bytes();
    buf[at] = b[0];
    buf[at + 1] = b[1];
}

impl NVTable {
    pub fn new(num_static_values: usize, init_length: usize, max_size: usize) -> Self {
        NVTable {
            payload: Vec::with_capacity(init_length),
            max_size,
            static_entries: vec![0u32; num_static_values],
            dyn_entries: Vec::new(),
            dyn_sorted: true,
        }
    }

    fn parse_entry(&self, ofs: u32) -> EntryView {
        let buf = &self.payload;
        let at = ofs as usize;
        let flags = buf[at];
        let indirect = flags & FLAG_INDIRECT != 0;
        let referenced = flags & FLAG_REFERENCED != 0;
        let name_len = buf[at + 1];
        if indirect {
            let ref_handle = NVHandle(read_u16(buf, at + 2));
            let ref_ofs = read_u16(buf, at + 4);
            let ref_len = read_u16(buf, at + 6);
            let ref_type = buf[at + 8];
            let header_len = 9 + name_len as usize;
            let alloc_len = read_u16(buf, at + header_len);
            EntryView {
                indirect: true,
                referenced,
                name_len,
                alloc_len,
                header_len: header_len + 2,
                value_len: 0,
                ref_handle,
                ref_ofs,
                ref_len,
                ref_type,
            }
        } else {
            let value_len = read_u16(buf, at + 2);
            let header_len = 4 + name_len as usize;
            let alloc_len = read_u16(buf, at + header_len + value_len as usize);
            EntryView {
                indirect: false,
                referenced,
                name_len,
                alloc_len,
                header_len,
                value_len,
                ref_handle: NVHandle::NONE,
                ref_ofs: 0,
                ref_len: 0,
                ref_type: 0,
            }
        }
    }

    fn entry_name<'a>(&'a self, ofs: u32, view: &EntryView) -> &'a [u8] {
        let at = ofs as usize;
        let name_start = at + if view.indirect { 9 } else { 4 };
        &self.payload[name_start..name_start + view.name_len as usize]
    }

    fn entry_value<'a>(&'a self, ofs: u32, view: &EntryView) -> &'a [u8] {
        let at = ofs as usize;
        let value_start = at + (if view.indirect { 9 } else { 4 }) + view.name_len as usize;
        &self.payload[value_start..value_start + view.value_len as usize]
    }

    fn slot_for_handle(&self, handle: NVHandle) -> Option<u32> {
        let idx = handle.0 as usize;
        if idx == 0 {
            return None;
        }
        if idx <= self.static_entries.len() {
            let ofs = self.static_entries[idx - 1];
            return if ofs == 0 { None } else { Some(ofs - 1) };
        }
        if self.dyn_sorted {
            self.dyn_entries
                .binary_search_by_key(&handle, |(h, _)| *h)
                .ok()
                .map(|i| self.dyn_entries[i].1)
        } else {
            self.dyn_entries
                .iter()
                .find(|(h, _)| *h == handle)
                .map(|(_, o)| *o)
        }
    }

    fn set_slot(&mut self, handle: NVHandle, ofs: u32) {
        let idx = handle.0 as usize;
        if idx <= self.static_entries.len() {
            self.static_entries[idx - 1] = ofs + 1;
            return;
        }
        if let Some(slot) = self
            .dyn_entries
            .iter_mut()
            .find(|(h, _)| *h == handle)
        {
            slot.1 = ofs;
            return;
        }
        if let Some(last) = self.dyn_entries.last() {
            if last.0 > handle {
                self.dyn_sorted = false;
            }
        }
        self.dyn_entries.push((handle, ofs));
    }

    /// Direct read: indirect entries resolve one hop, clamped to the
    /// referent's current length (never panics past bounds).
    pub fn get(&self, handle: NVHandle) -> &[u8] {
        let Some(ofs) = self.slot_for_handle(handle) else {
            return b"";
        };
        let view = self.parse_entry(ofs);
        if !view.indirect {
            return self.entry_value(ofs, &view);
        }
        let Some(ref_ofs) = self.slot_for_handle(view.ref_handle) else {
            return b"";
        };
        let ref_view = self.parse_entry(ref_ofs);
        let full = self.entry_value(ref_ofs, &ref_view);
        let start = (view.ref_ofs as usize).min(full.len());
        let end = start.saturating_add(view.ref_len as usize).min(full.len());
        &full[start..end]
    }

    fn mark_referenced(&mut self, handle: NVHandle, referenced: bool) {
        if let Some(ofs) = self.slot_for_handle(handle) {
            let at = ofs as usize;
            if referenced {
                self.payload[at] |= FLAG_REFERENCED;
            } else {
                self.payload[at] &= !FLAG_REFERENCED;
            }
        }
    }

    fn is_referenced(&self, handle: NVHandle) -> bool {
        self.slot_for_handle(handle)
            .map(|ofs| self.parse_entry(ofs).referenced)
            .unwrap_or(false)
    }

    /// Rewrites every indirect entry that points at `handle` into an owned
    /// direct copy of its currently-resolved bytes. Called before
    /// overwriting a `referenced` entry so existing indirect views keep
    /// seeing the bytes they were created against.
    fn rematerialize_dependents(&mut self, handle: NVHandle) -> crate::Result<()> {
        let targets: Vec<(NVHandle, Vec<u8>)> = {
            let mut found = Vec::new();
            for idx in 0..self.static_entries.len() {
                let h = NVHandle((idx + 1) as u16);
                if let Some(ofs) = self.slot_for_handle(h) {
                    let view = self.parse_entry(ofs);
                    if view.indirect && view.ref_handle == handle {
                        found.push((h, self.get(h).to_vec()));
                    }
                }
            }
            for (h, _) in self.dyn_entries.clone() {
                if let Some(ofs) = self.slot_for_handle(h) {
                    let view = self.parse_entry(ofs);
                    if view.indirect && view.ref_handle == handle {
                        found.push((h, self.get(h).to_vec()));
                    }
                }
            }
            found
        };
        for (h, bytes) in targets {
            let name = self.name_for(h);
            self.set_direct(h, &name, &bytes)?;
        }
        self.mark_referenced(handle, false);
        Ok(())
    }

    fn name_for(&self, handle: NVHandle) -> Vec<u8> {
        self.slot_for_handle(handle)
            .map(|ofs| {
                let view = self.parse_entry(ofs);
                self.entry_name(ofs, &view).to_vec()
            })
            .unwrap_or_default()
    }

    fn append_direct(&mut self, handle: NVHandle, name: &[u8], value: &[u8]) -> crate::Result<u32> {
        let header_len = 4 + name.len();
        let total = header_len + value.len() + 2;
        if self.payload.len() + total > self.max_size {
            return Err(crate::Error::OutOfSpace {
                requested: total,
                available: self.max_size.saturating_sub(self.payload.len()),
            });
        }
        let ofs = self.payload.len() as u32;
        self.payload.push(0); // flags
        self.payload.push(name.len() as u8);
        self.payload.extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.payload.extend_from_slice(name);
        self.payload.extend_from_slice(value);
        self.payload.extend_from_slice(&(total as u16).to_le_bytes());
        self.set_slot(handle, ofs);
        Ok(ofs)
    }

    fn set_direct(&mut self, handle: NVHandle, name: &[u8], value: &[u8]) -> crate::Result<()> {
        if let Some(ofs) = self.slot_for_handle(handle) {
            let view = self.parse_entry(ofs);
            if !view.indirect {
                let needed_total = 4 + name.len() + value.len() + 2;
                if needed_total <= view.alloc_len as usize && view.name_len as usize == name.len() {
                    // rewrite in place, keeping the original alloc_len so future
                    // shrink/grow within the slack still works.
                    let at = ofs as usize;
                    write_u16(&mut self.payload, at + 2, value.len() as u16);
                    let value_start = at + 4 + name.len();
                    self.payload[value_start..value_start + value.len()].copy_from_slice(value);
                    let alloc_at = at + 4 + name.len() + value.len();
                    write_u16(&mut self.payload, alloc_at, view.alloc_len);
                    return Ok(());
                }
            }
        }
        self.append_direct(handle, name, value)?;
        Ok(())
    }

    /// Adds or overwrites a direct entry. Returns `Err(OutOfSpace)` if it
    /// does not fit; the caller should call [`NVTable::realloc`] and retry.
    pub fn set_value(&mut self, handle: NVHandle, name: &[u8], value: &[u8]) -> crate::Result<()> {
        if self.is_referenced(handle) {
            self.rematerialize_dependents(handle)?;
        }
        self.set_direct(handle, name, value)
    }

    /// Adds an indirect view into `ref_handle`'s value at `[ofs, ofs+len)`.
    /// A reference to an already-indirect entry collapses to the ultimate
    /// direct ancestor, preserving the "one level only" invariant.
    pub fn set_value_indirect(
        &mut self,
        handle: NVHandle,
        name: &[u8],
        ref_handle: NVHandle,
        ptype: NVType,
        ofs: u16,
        len: u16,
    ) -> crate::Result<()> {
        let (resolved_handle, resolved_ofs) = match self.slot_for_handle(ref_handle) {
            Some(ref_ofs) => {
                let view = self.parse_entry(ref_ofs);
                if view.indirect {
                    (view.ref_handle, view.ref_ofs.saturating_add(ofs))
                } else {
                    (ref_handle, ofs)
                }
            }
            None => (ref_handle, ofs),
        };

        let header_len = 9 + name.len();
        let total = header_len + 2;
        if self.payload.len() + total > self.max_size {
            return Err(crate::Error::OutOfSpace {
                requested: total,
                available: self.max_size.saturating_sub(self.payload.len()),
            });
        }
        let new_ofs = self.payload.len() as u32;
        self.payload.push(FLAG_INDIRECT);
        self.payload.push(name.len() as u8);
        self.payload.extend_from_slice(&resolved_handle.0.to_le_bytes());
        self.payload.extend_from_slice(&resolved_ofs.to_le_bytes());
        self.payload.extend_from_slice(&len.to_le_bytes());
        self.payload.push(ptype as u8);
        self.payload.extend_from_slice(name);
        self.payload.extend_from_slice(&(total as u16).to_le_bytes());
        self.set_slot(handle, new_ofs);
        self.mark_referenced(resolved_handle, true);
        Ok(())
    }

    /// Doubles the configured capacity ceiling; call after `OutOfSpace` and
    /// retry the write.
    pub fn realloc(&mut self) {
        self.max_size = (self.max_size * 2).max(self.max_size + 256);
    }

    /// Produces an independent table with at least `headroom` extra bytes
    /// of slack, re-inserting every reachable entry (garbage from
    /// in-place-rewritten slots is dropped).
    pub fn clone_with_headroom(&self, headroom: usize) -> NVTable {
        let mut out = NVTable::new(
            self.static_entries.len(),
            self.payload.len() + headroom,
            self.max_size + headroom,
        );
        // direct entries first so indirect entries can resolve against them.
        let handles = self.all_handles();
        for h in &handles {
            let ofs = self.slot_for_handle(*h).unwrap();
            let view = self.parse_entry(ofs);
            if !view.indirect {
                let name = self.entry_name(ofs, &view).to_vec();
                let value = self.entry_value(ofs, &view).to_vec();
                out.append_direct(*h, &name, &value).expect("headroom sized for full copy");
            }
        }
        for h in &handles {
            let ofs = self.slot_for_handle(*h).unwrap();
            let view = self.parse_entry(ofs);
            if view.indirect {
                let name = self.entry_name(ofs, &view).to_vec();
                out.set_value_indirect(
                    *h,
                    &name,
                    view.ref_handle,
                    match view.ref_type {
                        1 => NVType::String,
                        2 => NVType::Estring,
                        3 => NVType::Qstring,
                        4 => NVType::Anystring,
                        5 => NVType::Number,
                        6 => NVType::Ipv4,
                        7 => NVType::Ipv6,
                        8 => NVType::Float,
                        _ => NVType::Other,
                    },
                    view.ref_ofs,
                    view.ref_len,
                )
                .expect("headroom sized for full copy");
            }
        }
        out
    }

    fn all_handles(&self) -> Vec<NVHandle> {
        let mut out = Vec::new();
        for idx in 0..self.static_entries.len() {
            if self.static_entries[idx] != 0 {
                out.push(NVHandle((idx + 1) as u16));
            }
        }
        for (h, _) in &self.dyn_entries {
            out.push(*h);
        }
        out
    }

    /// Iterates every entry (static then dynamic, otherwise unordered),
    /// short-circuiting when `f` returns `true`.
    pub fn foreach<F: FnMut(NVHandle, &[u8], &[u8]) -> bool>(&self, mut f: F) {
        for h in self.all_handles() {
            let value = self.get(h);
            let name = self.name_for(h);
            if f(h, &name, value) {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

static LOGMSG_REGISTRY: OnceLock<NVRegistry> = OnceLock::new();

/// The process-wide registry backing every `LogMessage`'s static built-in
/// value names (`HOST`, `MESSAGE`, `PROGRAM`, ...).
pub fn logmsg_registry() -> &'static NVRegistry {
    LOGMSG_REGISTRY.get_or_init(|| {
        NVRegistry::new(&[
            "HOST",
            "HOST_FROM",
            "MESSAGE",
            "PROGRAM",
            "PID",
            "MSGID",
            "SOURCE",
            "LEGACY_MSGHDR",
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NVRegistry {
        NVRegistry::new(&["HOST", "MESSAGE"])
    }

    #[test]
    fn set_then_get_roundtrips_exact_bytes() {
        let reg = registry();
        let mut t = NVTable::new(2, 64, 4096);
        let h = reg.lookup_handle(b"MESSAGE").unwrap();
        t.set_value(h, b"MESSAGE", b"hello\0world").unwrap();
        assert_eq!(t.get(h), b"hello\0world");
    }

    #[test]
    fn absent_handle_returns_empty() {
        let reg = registry();
        let t = NVTable::new(2, 64, 4096);
        let h = reg.lookup_handle(b"HOST").unwrap();
        assert_eq!(t.get(h), b"");
    }

    #[test]
    fn indirect_resolves_substring_of_referent() {
        let reg = registry();
        let extra = reg.get_or_assign_handle(b"rest").unwrap();
        let mut t = NVTable::new(2, 64, 4096);
        let msg = reg.lookup_handle(b"MESSAGE").unwrap();
        t.set_value(msg, b"MESSAGE", b"pattern foobar something tail")
            .unwrap();
        t.set_value_indirect(extra, b"rest", msg, NVType::Estring, 15, 9)
            .unwrap();
        assert_eq!(t.get(extra), b"something");
    }

    #[test]
    fn rewriting_referenced_entry_preserves_existing_indirect_view() {
        let reg = registry();
        let extra = reg.get_or_assign_handle(b"snippet").unwrap();
        let mut t = NVTable::new(2, 64, 4096);
        let msg = reg.lookup_handle(b"MESSAGE").unwrap();
        t.set_value(msg, b"MESSAGE", b"0123456789").unwrap();
        t.set_value_indirect(extra, b"snippet", msg, NVType::Estring, 2, 3)
            .unwrap();
        assert_eq!(t.get(extra), b"234");
        t.set_value(msg, b"MESSAGE", b"abcdefghij").unwrap();
        // the indirect view keeps seeing the bytes it was created against.
        assert_eq!(t.get(extra), b"234");
    }

    #[test]
    fn double_indirection_collapses_to_one_hop() {
        let reg = registry();
        let a = reg.get_or_assign_handle(b"a").unwrap();
        let b = reg.get_or_assign_handle(b"b").unwrap();
        let mut t = NVTable::new(2, 64, 4096);
        let msg = reg.lookup_handle(b"MESSAGE").unwrap();
        t.set_value(msg, b"MESSAGE", b"0123456789").unwrap();
        t.set_value_indirect(a, b"a", msg, NVType::Estring, 2, 5)
            .unwrap(); // "23456"
        t.set_value_indirect(b, b"b", a, NVType::Estring, 1, 3)
            .unwrap(); // should resolve against MESSAGE at ofs 3 -> "345"
        assert_eq!(t.get(b), b"345");
    }

    #[test]
    fn out_of_space_then_realloc_succeeds() {
        let reg = registry();
        let mut t = NVTable::new(2, 4, 8);
        let h = reg.lookup_handle(b"MESSAGE").unwrap();
        assert!(t.set_value(h, b"MESSAGE", b"this is too long for eight bytes").is_err());
        t.realloc();
        t.set_value(h, b"MESSAGE", b"fits now").unwrap();
        assert_eq!(t.get(h), b"fits now");
    }

    #[test]
    fn clone_with_headroom_is_independent() {
        let reg = registry();
        let mut t = NVTable::new(2, 64, 4096);
        let msg = reg.lookup_handle(b"MESSAGE").unwrap();
        t.set_value(msg, b"MESSAGE", b"original").unwrap();
        let mut clone = t.clone_with_headroom(32);
        clone.set_value(msg, b"MESSAGE", b"changed").unwrap();
        assert_eq!(t.get(msg), b"original");
        assert_eq!(clone.get(msg), b"changed");
    }
}
