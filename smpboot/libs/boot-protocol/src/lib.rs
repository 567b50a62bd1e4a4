// SPDX-License-Identifier: MPL-2.0

//! The shared-memory protocol between the bootstrap processor (BSP) and
//! booting application processors (APs).
//!
//! During multiprocessor boot, the BSP prepares a set of shared structures
//! (a page table, a descriptor table and an array of per-AP context
//! records), publishes pointers to them, and then wakes the APs. From that
//! point on, every AP races through the same code image: it takes a unique
//! CPU ID from a shared counter, indexes the record array with it, and
//! installs the stack and CPU-local base it finds there.
//!
//! This crate defines that contract in one place:
//!
//!  - the raw per-AP record layout ([`PerApRawInfo`]), shared bit-for-bit
//!    with the AP boot assembly;
//!  - the publication protocol for the shared pointer slots
//!    ([`publish_ptr`]/[`consume_ptr`]): the BSP's preparation writes are
//!    release-ordered before the publication, and a consumer's acquire
//!    read of the slot makes them visible;
//!  - the CPU-identity allocation ([`allocate_cpu_id`]): one indivisible
//!    fetch-and-increment per processor, never reused;
//!  - the mode-transition sequence an AP steps through
//!    ([`phase::BootPhase`]).
//!
//! The crate is deliberately free of anything machine-specific, so the
//! protocol can be exercised on the host by threads standing in for racing
//! processors.

#![cfg_attr(not(test), no_std)]

pub mod phase;

use core::sync::atomic::{AtomicU64, Ordering};

/// The CPU ID of the bootstrap processor.
pub const BSP_CPU_ID: u64 = 0;

/// The CPU ID handed to the first application processor.
///
/// The shared counter starts here; [`BSP_CPU_ID`] is never allocated.
pub const FIRST_AP_CPU_ID: u64 = 1;

/// The largest number of application processors the protocol supports.
///
/// The limit keeps every allocated CPU ID (and thus every record index)
/// within one page-sized pointer array on the BSP side. It is not checked
/// on the AP side, where no check is possible.
pub const MAX_APS: u64 = 1023;

/// The raw boot context record of one application processor.
///
/// The BSP stores one record per AP at index `cpu_id - 1` of the shared
/// array. The layout is a contract with the AP boot assembly, which reads
/// the two fields at byte offsets 0 and 8: keep it `#[repr(C)]` and exactly
/// 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerApRawInfo {
    /// The top of the stack the AP executes on.
    pub stack_top: u64,
    /// The base address of the AP's CPU-local storage.
    pub cpu_local: u64,
}

/// Publishes a pointer value into a shared slot.
///
/// The store is release-ordered, so every preparation write the caller
/// performed before publishing is visible to any reader that consumes the
/// slot with [`consume_ptr`] and observes the published value.
///
/// # Safety
///
/// The caller must ensure that:
///  - `slot` is valid for reads and writes, aligned to 8 bytes, and zero
///    before the call;
///  - it is the only writer of the slot, and writes it exactly once;
///  - the published value, if it is an address, stays valid and unchanged
///    for as long as any consumer may dereference it.
pub unsafe fn publish_ptr(slot: *mut u64, value: u64) {
    // SAFETY: The slot is valid and aligned as per the caller's guarantee,
    // and all access to it from this point on is atomic.
    let slot = unsafe { AtomicU64::from_ptr(slot) };
    slot.store(value, Ordering::Release);
}

/// Reads a shared pointer slot published with [`publish_ptr`].
///
/// Returns zero if the slot has not been published yet. A non-zero return
/// value acquire-synchronizes with the publication, making all of the
/// publisher's preparation writes visible.
///
/// # Safety
///
/// The caller must ensure that `slot` is valid for reads, aligned to
/// 8 bytes, and only ever written through [`publish_ptr`].
pub unsafe fn consume_ptr(slot: *const u64) -> u64 {
    // SAFETY: The slot is valid and aligned as per the caller's guarantee,
    // and all access to it is atomic.
    let slot = unsafe { AtomicU64::from_ptr(slot.cast_mut()) };
    slot.load(Ordering::Acquire)
}

/// Takes a unique CPU ID from the shared counter.
///
/// This is one indivisible fetch-and-increment; processors racing on the
/// counter serialize on it and each keeps the pre-increment value as its
/// permanent identity. IDs are contiguous from [`FIRST_AP_CPU_ID`] among
/// the processors that reach this operation, and are never reused within a
/// boot session.
///
/// The AP boot assembly performs the same operation on the same slot with
/// a `lock xadd` instruction, whose full-barrier semantics are strictly
/// stronger than the acquire-release ordering used here.
///
/// # Safety
///
/// The caller must ensure that `counter` is valid for reads and writes,
/// aligned to 8 bytes, initialized to [`FIRST_AP_CPU_ID`], and only ever
/// accessed through this function (or the equivalent locked instruction).
pub unsafe fn allocate_cpu_id(counter: *mut u64) -> u64 {
    // SAFETY: The counter is valid and aligned as per the caller's
    // guarantee, and all access to it is atomic.
    let counter = unsafe { AtomicU64::from_ptr(counter) };
    counter.fetch_add(1, Ordering::AcqRel)
}

/// Reads the boot context record of the processor with the given CPU ID.
///
/// The record index is `cpu_id - 1`: the BSP keeps no record for itself.
///
/// # Safety
///
/// The caller must ensure that `array` points to a fully populated record
/// array obtained from a [`consume_ptr`] read, and that `cpu_id` was
/// allocated by [`allocate_cpu_id`] against an array sized for all
/// processors that may boot. No bounds check is possible here; the sizing
/// precondition is owned by the publisher.
pub unsafe fn read_ap_info(array: *const PerApRawInfo, cpu_id: u64) -> PerApRawInfo {
    debug_assert!(cpu_id >= FIRST_AP_CPU_ID);
    // SAFETY: The index is in bounds as per the caller's guarantee, and
    // the array is not written concurrently once published.
    unsafe { array.add((cpu_id - FIRST_AP_CPU_ID) as usize).read() }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Lets raw pointers cross thread boundaries in tests; every test
    /// upholds the aliasing rules itself.
    #[derive(Clone, Copy)]
    struct AssumeSend<T>(T);
    unsafe impl<T> Send for AssumeSend<T> {}
    unsafe impl<T> Sync for AssumeSend<T> {}

    #[test]
    fn record_layout_matches_the_assembly_contract() {
        assert_eq!(core::mem::size_of::<PerApRawInfo>(), 16);
        let info = PerApRawInfo {
            stack_top: 0x1111,
            cpu_local: 0x2222,
        };
        let base = &info as *const _ as usize;
        assert_eq!(&info.stack_top as *const _ as usize - base, 0);
        assert_eq!(&info.cpu_local as *const _ as usize - base, 8);
    }

    #[test]
    fn racing_allocations_yield_distinct_contiguous_ids() {
        for num_aps in [1usize, 2, 3, 4, 8, 16, 32, 64] {
            let counter = AtomicU64::new(FIRST_AP_CPU_ID);
            let counter_ptr = AssumeSend(counter.as_ptr());
            let ids = Mutex::new(Vec::new());

            std::thread::scope(|s| {
                for _ in 0..num_aps {
                    s.spawn(|| {
                        let ptr = counter_ptr;
                        // SAFETY: The counter outlives the scope and is
                        // only accessed atomically.
                        let id = unsafe { allocate_cpu_id(ptr.0) };
                        ids.lock().unwrap().push(id);
                    });
                }
            });

            let mut ids = ids.into_inner().unwrap();
            ids.sort_unstable();
            let expected: Vec<u64> =
                (FIRST_AP_CPU_ID..FIRST_AP_CPU_ID + num_aps as u64).collect();
            assert_eq!(ids, expected, "with {num_aps} racing processors");
        }
    }

    #[test]
    fn allocated_ids_are_never_reused() {
        let counter = AtomicU64::new(FIRST_AP_CPU_ID);
        let ptr = counter.as_ptr();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            // SAFETY: The counter lives on this stack frame and is only
            // accessed atomically.
            let id = unsafe { allocate_cpu_id(ptr) };
            assert!(seen.insert(id), "ID {id} was allocated twice");
        }
    }

    #[test]
    fn every_processor_loads_its_own_record() {
        // The three-processor scenario: distinct stacks and bases, one
        // bijection between IDs and records expected.
        let records = [
            PerApRawInfo {
                stack_top: 0x7000,
                cpu_local: 0xA000,
            },
            PerApRawInfo {
                stack_top: 0x8000,
                cpu_local: 0xB000,
            },
            PerApRawInfo {
                stack_top: 0x9000,
                cpu_local: 0xC000,
            },
        ];
        let counter = AtomicU64::new(FIRST_AP_CPU_ID);
        let counter_ptr = AssumeSend(counter.as_ptr());
        let array_ptr = AssumeSend(records.as_ptr());
        let loaded = Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for _ in 0..records.len() {
                s.spawn(|| {
                    let (counter_ptr, array_ptr) = (counter_ptr, array_ptr);
                    // SAFETY: The counter and the fully populated array
                    // outlive the scope; the array is never written.
                    let (id, info) = unsafe {
                        let id = allocate_cpu_id(counter_ptr.0);
                        (id, read_ap_info(array_ptr.0, id))
                    };
                    loaded.lock().unwrap().push((id, info));
                });
            }
        });

        let mut loaded = loaded.into_inner().unwrap();
        loaded.sort_unstable_by_key(|(id, _)| *id);
        for (i, (id, info)) in loaded.iter().enumerate() {
            assert_eq!(*id, FIRST_AP_CPU_ID + i as u64);
            assert_eq!(*info, records[i], "processor {id} loaded a foreign record");
        }
    }

    #[test]
    fn no_processor_observes_an_unpublished_record() {
        // A publisher that dawdles over the array must not let any
        // consumer see a zero placeholder: consumers spin until the slot
        // is published, and the publication release-orders the writes.
        const NUM_APS: usize = 16;
        const ROUNDS: usize = 50;

        for round in 0..ROUNDS {
            let mut records = vec![PerApRawInfo {
                stack_top: 0,
                cpu_local: 0,
            }; NUM_APS];
            let counter = AtomicU64::new(FIRST_AP_CPU_ID);
            let slot = AtomicU64::new(0);

            let counter_ptr = AssumeSend(counter.as_ptr());
            let slot_ptr = AssumeSend(slot.as_ptr());
            let records_ptr = AssumeSend(records.as_mut_ptr());

            std::thread::scope(|s| {
                for _ in 0..NUM_APS {
                    s.spawn(|| {
                        let (counter_ptr, slot_ptr) = (counter_ptr, slot_ptr);
                        // SAFETY: The slot is only written by the
                        // publisher below through `publish_ptr`.
                        let array = loop {
                            let ptr = unsafe { consume_ptr(slot_ptr.0) };
                            if ptr != 0 {
                                break ptr as *const PerApRawInfo;
                            }
                            std::hint::spin_loop();
                        };
                        // SAFETY: A non-zero slot value acquires the
                        // publisher's preparation writes.
                        let (id, info) = unsafe {
                            let id = allocate_cpu_id(counter_ptr.0);
                            (id, read_ap_info(array, id))
                        };
                        assert_ne!(info.stack_top, 0, "round {round}: processor {id} saw a placeholder stack");
                        assert_ne!(info.cpu_local, 0, "round {round}: processor {id} saw a placeholder base");
                        assert_eq!(info.cpu_local, info.stack_top + 1);
                    });
                }

                // The publisher: populate every record, with varying
                // delays to shake the interleavings, then publish.
                let records_ptr = records_ptr;
                for i in 0..NUM_APS {
                    for _ in 0..(round * 37 + i * 11) % 500 {
                        std::hint::spin_loop();
                    }
                    let stack_top = 0x1000 * (i as u64 + 1);
                    // SAFETY: Before publication this thread is the only
                    // accessor of the records.
                    unsafe {
                        records_ptr.0.add(i).write(PerApRawInfo {
                            stack_top,
                            cpu_local: stack_top + 1,
                        });
                    }
                }
                // SAFETY: The slot is zero, written once, and the records
                // stay valid for the whole scope.
                unsafe { publish_ptr(slot_ptr.0, records_ptr.0 as u64) };
            });
        }
    }

    #[test]
    fn returned_handoff_makes_no_further_allocations() {
        let counter = AtomicU64::new(FIRST_AP_CPU_ID);
        let ptr = counter.as_ptr();

        // A processor allocates its identity exactly once. If its handoff
        // target returns, it parks; the counter must show no trace of it
        // afterwards.
        // SAFETY: The counter lives on this stack frame and is only
        // accessed atomically.
        let id = unsafe { allocate_cpu_id(ptr) };
        assert_eq!(id, FIRST_AP_CPU_ID);

        let mut processor = phase::BootPhase::RealMode16;
        while let Some(next) = processor.successor() {
            processor = next;
        }
        assert_eq!(processor, phase::BootPhase::Halted);
        assert_eq!(counter.load(Ordering::Relaxed), FIRST_AP_CPU_ID + 1);
    }
}
