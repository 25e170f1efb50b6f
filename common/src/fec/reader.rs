//! FEC block reader.
//!
//! Reassembles FEC blocks from the validated source stream and the repair
//! queue, reconstructs lost source packets when enough of the block arrived,
//! and yields source packets in ascending order. A block that cannot be
//! repaired yields whatever source packets it has; the depacketizer renders
//! the remaining hole as silence.

use std::collections::VecDeque;

use tracing::{debug, error};

use crate::endpoint::Protocol;
use crate::fec::codec::BlockDecoder;
use crate::packet::{flags, Packet, PacketPtr, PacketReader};
use crate::pool::BufferPool;
use crate::rtp::parse;
use crate::units::{blknum_diff, Blknum};

/// FEC reader tuning.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Maximum tolerated block number jump before the chain is considered
    /// broken.
    pub max_block_jump: u16,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        // ---
        Self { max_block_jump: 100 }
    }
}

/// Packet reader masking loss with block redundancy.
pub struct FecReader {
    decoder: Box<dyn BlockDecoder>,
    byte_pool: BufferPool<u8>,
    config: ReaderConfig,
    n_source: usize,
    n_repair: usize,

    started: bool,
    cur_blknum: Blknum,
    source_slots: Vec<Option<PacketPtr>>,
    repair_slots: Vec<Option<PacketPtr>>,
    next_block_seen: bool,

    stash_source: VecDeque<PacketPtr>,
    stash_repair: VecDeque<PacketPtr>,
    ready: VecDeque<PacketPtr>,

    recovered_total: u64,
    alive: bool,
}

impl FecReader {
    // ---
    /// Creates a reader for a block layout of `n_source` + `n_repair`
    /// packets.
    ///
    /// Returns `None` when the scheme has no codec.
    pub fn new(
        config: &ReaderConfig,
        scheme: crate::packet::FecScheme,
        n_source: usize,
        n_repair: usize,
        byte_pool: BufferPool<u8>,
    ) -> Option<Self> {
        // ---
        let decoder = crate::fec::codec::new_decoder(scheme, n_source, n_repair)?;

        debug!(
            "fec reader: initializing: scheme={:?} n_source={} n_repair={}",
            scheme, n_source, n_repair
        );

        Some(Self {
            decoder,
            byte_pool,
            config: config.clone(),
            n_source,
            n_repair,
            started: false,
            cur_blknum: 0,
            source_slots: vec![None; n_source],
            repair_slots: (0..n_repair).map(|_| None).collect(),
            next_block_seen: false,
            stash_source: VecDeque::new(),
            stash_repair: VecDeque::new(),
            ready: VecDeque::new(),
            recovered_total: 0,
            alive: true,
        })
    }

    /// Returns whether the FEC chain is still usable. A dead chain is a
    /// session failure.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Returns how many packets were reconstructed so far.
    pub fn recovered_total(&self) -> u64 {
        self.recovered_total
    }

    /// Yields the next source packet in order, pulling from both inputs and
    /// repairing blocks as they close.
    pub fn read(
        &mut self,
        source: &mut dyn PacketReader,
        repair: &mut dyn PacketReader,
    ) -> Option<PacketPtr> {
        // ---
        if !self.alive {
            return None;
        }

        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Some(packet);
            }

            self.fetch_repair(repair);
            self.fetch_source(source);

            if !self.alive || !self.try_finish_block() {
                return self.ready.pop_front();
            }
        }
    }

    fn fetch_repair(&mut self, repair: &mut dyn PacketReader) {
        // ---
        while let Some(packet) = repair.read() {
            let fec = match &packet.fec {
                Some(fec) => fec.clone(),
                None => {
                    debug!("fec reader: dropping repair packet without block metadata");
                    continue;
                }
            };

            if !self.check_block_layout(fec.source_block_len, fec.repair_block_len) {
                continue;
            }

            if !self.started {
                self.start(fec.blknum);
            }

            let dist = blknum_diff(fec.blknum, self.cur_blknum);
            if dist < 0 {
                debug!("fec reader: dropping repair packet of past block: blknum={}", fec.blknum);
            } else if dist == 0 {
                let slot = fec.encoding_symbol_id as usize;
                if slot >= self.n_source && slot < self.n_source + self.n_repair {
                    self.repair_slots[slot - self.n_source] = Some(packet);
                } else {
                    debug!("fec reader: repair packet esi out of range: esi={}", slot);
                }
            } else {
                self.check_block_jump(dist);
                self.next_block_seen = true;
                self.stash_repair.push_back(packet);
            }
        }
    }

    fn fetch_source(&mut self, source: &mut dyn PacketReader) {
        // ---
        while let Some(packet) = source.read() {
            self.place_source(packet);
        }
    }

    fn place_source(&mut self, packet: PacketPtr) {
        // ---
        let fec = match &packet.fec {
            Some(fec) => fec.clone(),
            None => {
                debug!("fec reader: dropping source packet without block metadata");
                return;
            }
        };

        if !self.check_block_layout(fec.source_block_len, fec.repair_block_len) {
            return;
        }

        if !self.started {
            self.start(fec.blknum);
        }

        let dist = blknum_diff(fec.blknum, self.cur_blknum);
        if dist < 0 {
            debug!("fec reader: dropping source packet of past block: blknum={}", fec.blknum);
        } else if dist == 0 {
            let slot = fec.encoding_symbol_id as usize;
            if slot < self.n_source {
                self.source_slots[slot] = Some(packet);
            } else {
                debug!("fec reader: source packet esi out of range: esi={}", slot);
            }
        } else {
            self.check_block_jump(dist);
            self.next_block_seen = true;
            self.stash_source.push_back(packet);
        }
    }

    fn start(&mut self, blknum: Blknum) {
        // ---
        debug!("fec reader: starting: blknum={}", blknum);
        self.started = true;
        self.cur_blknum = blknum;
    }

    fn check_block_layout(&mut self, source_block_len: u16, repair_block_len: u16) -> bool {
        // ---
        if source_block_len as usize != self.n_source || repair_block_len as usize != self.n_repair
        {
            error!(
                "fec reader: block layout mismatch: expected {}+{}, got {}+{}",
                self.n_source, self.n_repair, source_block_len, repair_block_len
            );
            self.alive = false;
            return false;
        }
        true
    }

    fn check_block_jump(&mut self, dist: i16) {
        // ---
        if dist as u16 > self.config.max_block_jump {
            error!(
                "fec reader: too long block number jump: cur={} dist={}",
                self.cur_blknum, dist
            );
            self.alive = false;
        }
    }

    /// Closes the current block if it is complete, decodable, or
    /// superseded. Returns whether a block was closed (and so more packets
    /// may be ready).
    fn try_finish_block(&mut self) -> bool {
        // ---
        if !self.started {
            return false;
        }

        let n_source_present = self.source_slots.iter().filter(|s| s.is_some()).count();
        let n_repair_present = self.repair_slots.iter().filter(|s| s.is_some()).count();

        let complete = n_source_present == self.n_source;
        let decodable = n_source_present + n_repair_present >= self.n_source;

        if !complete && !decodable && !self.next_block_seen {
            return false;
        }

        if !complete {
            self.repair_block();
        }

        for slot in self.source_slots.iter_mut() {
            if let Some(packet) = slot.take() {
                self.ready.push_back(packet);
            }
        }

        self.advance_block();
        true
    }

    fn repair_block(&mut self) {
        // ---
        let n_repair_present = self.repair_slots.iter().filter(|s| s.is_some()).count();
        if n_repair_present == 0 {
            return;
        }

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.n_source + self.n_repair);
        for slot in &self.source_slots {
            shards.push(slot.as_ref().map(|p| {
                let image_len = p.data().len() - crate::rtp::FEC_FOOTER_SIZE;
                p.data()[..image_len].to_vec()
            }));
        }
        for slot in &self.repair_slots {
            shards.push(slot.as_ref().map(|p| p.payload().to_vec()));
        }

        if !self.decoder.decode(&mut shards) {
            debug!("fec reader: block not repairable: blknum={}", self.cur_blknum);
            return;
        }

        for index in 0..self.n_source {
            if self.source_slots[index].is_some() {
                continue;
            }
            let image = match &shards[index] {
                Some(image) => image,
                None => continue,
            };
            if let Some(packet) = self.restore_packet(image) {
                self.recovered_total += 1;
                self.source_slots[index] = Some(packet);
            }
        }
    }

    fn restore_packet(&mut self, image: &[u8]) -> Option<PacketPtr> {
        // ---
        let mut data = match self.byte_pool.allocate() {
            Some(data) => data,
            None => {
                error!("fec reader: can't allocate restored packet");
                return None;
            }
        };

        if data.len() < image.len() {
            error!(
                "fec reader: restored packet does not fit pool buffer: need={} have={}",
                image.len(),
                data.len()
            );
            return None;
        }
        data.truncate(image.len());
        data.copy_from_slice(image);

        let mut packet = Packet::new(data);
        if !parse(Protocol::Rtp, &mut packet) {
            debug!("fec reader: dropping unparseable restored packet");
            return None;
        }

        packet.add_flags(flags::RESTORED);
        Some(packet.into_shared())
    }

    fn advance_block(&mut self) {
        // ---
        self.cur_blknum = self.cur_blknum.wrapping_add(1);
        self.next_block_seen = false;
        for slot in self.repair_slots.iter_mut() {
            *slot = None;
        }

        // Re-place stashed packets; anything for blocks further ahead goes
        // back onto the stash.
        let stash: Vec<PacketPtr> = self.stash_source.drain(..).collect();
        for packet in stash {
            self.place_source(packet);
        }

        let stash: Vec<PacketPtr> = self.stash_repair.drain(..).collect();
        for packet in stash {
            let fec = packet.fec.as_ref().unwrap().clone();
            let dist = blknum_diff(fec.blknum, self.cur_blknum);
            if dist < 0 {
                continue;
            }
            if dist == 0 {
                let slot = fec.encoding_symbol_id as usize;
                if slot >= self.n_source && slot < self.n_source + self.n_repair {
                    self.repair_slots[slot - self.n_source] = Some(packet);
                }
            } else {
                self.next_block_seen = true;
                self.stash_repair.push_back(packet);
            }
        }
    }
}
