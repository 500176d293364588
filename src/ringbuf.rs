// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use log::{debug, warn};
use std::sync::{Condvar, Mutex};

struct RingState {
    slots: Vec<Box<[u8]>>,
    lens: Vec<u32>,
    // logical indices range over 0..2*num; write == read means empty,
    // write == read ^ num means full
    write_ix: u32,
    read_ix: u32,
    stopped: bool,
}

impl RingState {
    fn is_full(&self, num: u32) -> bool {
        self.write_ix == (self.read_ix ^ num)
    }

    fn is_empty(&self) -> bool {
        self.write_ix == self.read_ix
    }
}

/// Bounded single-producer single-consumer byte-message queue. Each push
/// deposits one message of up to `slot_size` bytes; pops return messages in
/// push order. `stop` wakes both sides and makes every subsequent or blocked
/// call return `false`.
pub struct RingBuffer {
    slot_size: u32,
    num: u32,
    state: Mutex<RingState>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl RingBuffer {
    /// `num` must be a power of two.
    pub fn new(slot_size: u32, num: u32) -> Option<RingBuffer> {
        if slot_size == 0 || num == 0 || (num & (num - 1)) != 0 {
            warn!("ring buffer init slot_size:{} num:{} error", slot_size, num);
            return None;
        }
        let slots = (0..num)
            .map(|_| vec![0u8; slot_size as usize].into_boxed_slice())
            .collect();
        Some(RingBuffer {
            slot_size,
            num,
            state: Mutex::new(RingState {
                slots,
                lens: vec![0u32; num as usize],
                write_ix: 0,
                read_ix: 0,
                stopped: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    pub fn push(&self, buf: &[u8]) -> bool {
        if buf.is_empty() || buf.len() > self.slot_size as usize {
            warn!(
                "ring buffer push error, len:{} slot_size:{}",
                buf.len(),
                self.slot_size
            );
            return false;
        }
        let mut state = self.state.lock().unwrap();
        while state.is_full(self.num) {
            if state.stopped {
                warn!("ring buffer push stopped");
                return false;
            }
            debug!("ring buffer full, wait");
            state = self.not_full.wait(state).unwrap();
        }
        if state.stopped {
            warn!("ring buffer push stopped");
            return false;
        }

        let index = (state.write_ix & (self.num - 1)) as usize;
        state.slots[index][..buf.len()].copy_from_slice(buf);
        state.lens[index] = buf.len() as u32;
        state.write_ix = (state.write_ix + 1) & (2 * self.num - 1);
        drop(state);

        self.not_empty.notify_all();
        true
    }

    pub fn pop(&self, buf: &mut [u8]) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        while state.is_empty() {
            if state.stopped {
                warn!("ring buffer pop stopped");
                return None;
            }
            debug!("ring buffer empty, wait");
            state = self.not_empty.wait(state).unwrap();
        }

        let index = (state.read_ix & (self.num - 1)) as usize;
        let len = state.lens[index] as usize;
        if len > buf.len() {
            warn!("ring buffer pop dst too small, len:{}", len);
            return None;
        }
        buf[..len].copy_from_slice(&state.slots[index][..len]);
        state.read_ix = (state.read_ix + 1) & (2 * self.num - 1);
        drop(state);

        self.not_full.notify_all();
        Some(len)
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn stop_push(&self) {
        self.state.lock().unwrap().stopped = true;
        self.not_full.notify_all();
    }

    pub fn stop_pop(&self) {
        self.state.lock().unwrap().stopped = true;
        self.not_empty.notify_all();
    }

    /// Clears indices and recorded lengths. The stopped flag is untouched.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.write_ix = 0;
        state.read_ix = 0;
        state.lens.iter_mut().for_each(|l| *l = 0);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn init_rejects_bad_geometry() {
        assert!(RingBuffer::new(0, 16).is_none());
        assert!(RingBuffer::new(1024, 0).is_none());
        assert!(RingBuffer::new(1024, 15).is_none());
        assert!(RingBuffer::new(1024, 16).is_some());
    }

    #[test]
    fn push_pop_order_across_threads() {
        // 512 records of 4 bytes through a 16-slot ring
        let ring = Arc::new(RingBuffer::new(1024, 16).unwrap());
        let producer_ring = Arc::clone(&ring);
        let producer = thread::spawn(move || {
            for i in 0u32..512 {
                let buf = [(i % 255) as u8, (i / 255) as u8, 0, 0];
                assert!(producer_ring.push(&buf));
            }
        });

        let mut received = 0u32;
        let mut buf = [0u8; 1024];
        while received < 512 {
            let len = ring.pop(&mut buf).unwrap();
            assert_eq!(len, 4);
            assert_eq!(buf[0], (received % 255) as u8);
            assert_eq!(buf[1], (received / 255) as u8);
            received += 1;
        }
        assert_eq!(received, 512);
        producer.join().unwrap();
    }

    #[test]
    fn rejects_oversized_and_empty_messages() {
        let ring = RingBuffer::new(8, 4).unwrap();
        assert!(!ring.push(&[]));
        assert!(!ring.push(&[0u8; 9]));
        assert!(ring.push(&[0u8; 8]));
    }

    #[test]
    fn stop_unblocks_both_sides() {
        let ring = Arc::new(RingBuffer::new(16, 2).unwrap());

        // blocked consumer wakes with failure
        let consumer_ring = Arc::clone(&ring);
        let consumer = thread::spawn(move || {
            let mut buf = [0u8; 16];
            consumer_ring.pop(&mut buf).is_none()
        });
        thread::sleep(Duration::from_millis(20));
        ring.stop();
        assert!(consumer.join().unwrap());

        // full ring: blocked producer wakes with failure
        let ring = Arc::new(RingBuffer::new(16, 2).unwrap());
        assert!(ring.push(&[1u8; 16]));
        assert!(ring.push(&[2u8; 16]));
        let producer_ring = Arc::clone(&ring);
        let producer = thread::spawn(move || !producer_ring.push(&[3u8; 16]));
        thread::sleep(Duration::from_millis(20));
        ring.stop_push();
        assert!(producer.join().unwrap());

        // pushes after stop fail immediately
        assert!(!ring.push(&[4u8; 16]));
    }

    #[test]
    fn reset_keeps_stop_flag() {
        let ring = RingBuffer::new(16, 2).unwrap();
        assert!(ring.push(&[7u8; 3]));
        ring.stop();
        ring.reset();
        assert!(ring.is_stopped());
        assert!(!ring.push(&[7u8; 3]));
    }
}
