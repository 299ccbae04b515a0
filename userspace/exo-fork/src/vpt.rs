// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Iteration over the self-mapped page tables.

use exo_abi::layout::{NPTENTRIES, PGSHIFT};
use exo_abi::{PageNum, Pte, VirtAddr};

use crate::sys::PageTableView;

/// Present mappings of a [`PageTableView`] in ascending page order.
///
/// Directory groups whose entry is absent are skipped in one step, so the
/// walk never reads a page-table entry the self-map would fault on.
pub struct Mappings<'a, V: ?Sized> {
    view: &'a V,
    cursor: u32,
    end: u32,
    group: Option<u32>,
}

impl<'a, V: PageTableView + ?Sized> Mappings<'a, V> {
    /// Walks every page below `limit`.
    pub fn new(view: &'a V, limit: VirtAddr) -> Self {
        Self { view, cursor: 0, end: limit.raw() >> PGSHIFT, group: None }
    }
}

impl<V: PageTableView + ?Sized> Iterator for Mappings<'_, V> {
    type Item = (PageNum, Pte);

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.end {
            let pn = PageNum::new(self.cursor);
            if self.group != Some(pn.pdx()) {
                if !self.view.pde(pn.pdx()).is_present() {
                    self.cursor = (pn.pdx() + 1) * NPTENTRIES;
                    continue;
                }
                self.group = Some(pn.pdx());
            }
            self.cursor += 1;
            let pte = self.view.pte(pn);
            if pte.is_present() {
                return Some((pn, pte));
            }
        }
        None
    }
}
