//! The chip: owns every hart/core/memory-region/device object and drives
//! the cooperative scheduler's per-tick execution cycle.
//!
//! This is the integration point the rest of the crate is built to plug
//! into: `MemoryRegion`/`EsrPlane` give raw storage and decode, `mmu`/`pma`
//! give per-access checks, `isa` gives fetch/decode/execute, `tensor` gives
//! the coprocessor FSMs, `debug` gives the dmctrl protocol — `Chip` is
//! where their side effects meet (waking harts, broadcasting ESR writes,
//! completing cooperative tensor loads, retiring the tensor queue).
//!
//! `Chip` exclusively owns the Hart, Core, MemoryRegion, and PLIC objects,
//! following the struct-owns-everything-behind-plain-fields style used
//! throughout this crate's top-level wiring.

use crate::config::EmulatorConfig;
use crate::core::{Core, TensorOpKind};
use crate::debug::{self, DebugModule, DmCtrlEffect};
use crate::devices::plic::Plic;
use crate::devices::sysinfo::SysInfo;
use crate::devices::timer::{ApbTimer, RvTimer};
use crate::devices::uart::Uart;
use crate::devices::watchdog::Watchdog;
use crate::error::{DebugCause, Trap};
use crate::esr::{self, fields, EsrAddr, EsrPlane, SubRegion, NEIGH_BROADCAST, SHIRE_LOCAL};
use crate::hart::{wait_kind, Hart, HartState};
use crate::isa::{self, Inst};
use crate::memory::dram::Dram;
use crate::memory::rom::Rom;
use crate::memory::sram::Sram;
use crate::memory::{Agent, PhysicalMemory, Region};
use crate::mmu::{self, AccessType, Mode};
use crate::pma;
use crate::scheduler::Scheduler;
use crate::tensor::coop::{CoopOperand, CoopTable, TCoop};
use crate::tensor::tfma::{OperandType, TFmaParams};
use crate::tensor::treduce::{ReduceOp, ReduceRole};
use crate::topology::{CoreId, HartId, ShireKind, Topology};

// SP region address map (0x00_4000_0000-0x00_7FFF_FFFF):
// boot ROM, SRAM, and SP-misc (sysinfo) each get a 1 MiB slice.
pub const ROM_BASE: u64 = 0x4000_0000;
pub const ROM_SIZE: u64 = 0x0010_0000;
pub const SRAM_BASE: u64 = 0x4010_0000;
pub const SRAM_SIZE: u64 = 0x0010_0000;

/// Why the run loop stopped — maps to the driver's process exit code and
/// to the user-visible PASS/FAIL signal from guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pass,
    Fail,
    MaxCycles,
    NoProgress,
}

impl StopReason {
    pub fn exit_code(self) -> i32 {
        match self {
            StopReason::Pass => 0,
            StopReason::Fail => 1,
            StopReason::MaxCycles => 2,
            StopReason::NoProgress => 3,
        }
    }
}

pub struct Chip {
    pub config: EmulatorConfig,
    pub topology: Topology,
    pub harts: Vec<Hart>,
    pub cores: Vec<Core>,
    pub mem: PhysicalMemory,
    pub debug: DebugModule,
    pub scheduler: Scheduler,
    pub coop: CoopTable,
    pub rvtimer: RvTimer,
    pub apb_timer: ApbTimer,
    pub watchdog: Watchdog,
    pub plic_index: usize,
    pub esr_index: usize,
    pub broadcast_data: u64,
    pub reset_cause: u32,
    pub spin_lock: u64,
    pub done: Option<StopReason>,
}

fn is_sp_hart(topology: &Topology, id: HartId) -> bool {
    topology.shires[topology.shire_of_hart(id) as usize].kind == ShireKind::Io
}

impl Chip {
    /// Build a chip from `config`: lays out the physical address map,
    /// sizes the ESR plane/PLIC/timers to the topology, and creates every
    /// hart `Unavailable` except thread 0 of each minion and the single
    /// I/O-shire hart (reset-held until a `thread1_disable` write or
    /// boot-time enable brings the sibling thread up).
    pub fn new(config: EmulatorConfig) -> Self {
        let topology = Topology::new(config.n_compute_shires, config.n_memory_shires);
        let n_cores = topology.total_cores() as usize;
        let n_harts = topology.total_harts() as usize;
        let n_shires = topology.shires.len();
        // `neigh_global(shire, neigh) = shire*4+neigh` indexes by absolute
        // shire position across every shire (IO/compute/memory alike), so
        // the bank needs 4 slots per shire regardless of how many of those
        // shires are actually compute shires with real neighborhoods.
        let n_neighborhoods = n_shires * 4;

        let mut harts: Vec<Hart> = (0..n_harts)
            .map(|i| Hart::new(HartId(i as u32), config.reset_pc))
            .collect();
        let cores: Vec<Core> = (0..n_cores).map(|i| Core::new(CoreId(i as u32))).collect();

        for core_idx in 0..n_cores {
            let h0 = HartId(core_idx as u32 * 2);
            harts[h0.0 as usize].state = HartState::Running;
        }

        let mut mem = PhysicalMemory::new();
        mem.add_region(Region::Rom(Rom::new(ROM_BASE, ROM_SIZE, Vec::new())));
        mem.add_region(Region::Sram(Sram::new(SRAM_BASE, SRAM_SIZE)));
        mem.add_region(Region::SysInfo(SysInfo::new(n_harts as u32)));
        mem.add_region(Region::Uart(Uart::new()));
        mem.add_region(Region::Plic(Plic::new(n_harts)));
        mem.add_region(Region::Esr(EsrPlane::new(n_harts, n_neighborhoods, n_shires)));
        mem.add_region(Region::Dram(Dram::new(pma::DRAM_BASE, config.dram_size.bytes())));

        let esr_index = mem
            .region(pma::ESR_BASE)
            .map(|_| 0)
            .expect("esr region present");
        let plic_index = 0;

        let mut scheduler = Scheduler::new();
        for h in harts.iter().filter(|h| h.state == HartState::Running) {
            scheduler.activate(h.id);
        }

        Chip {
            config,
            topology,
            harts,
            cores,
            mem,
            debug: DebugModule::new(),
            scheduler,
            coop: CoopTable::new(n_neighborhoods),
            rvtimer: RvTimer::new(n_harts),
            apb_timer: ApbTimer::new(),
            watchdog: Watchdog::new(1_000_000),
            plic_index,
            esr_index,
            broadcast_data: 0,
            reset_cause: 0,
            spin_lock: 0,
            done: None,
        }
    }

    fn esr_plane_mut(&mut self) -> &mut EsrPlane {
        match self.mem.region_mut(pma::ESR_BASE) {
            Some(Region::Esr(p)) => p,
            _ => unreachable!("ESR region must be present"),
        }
    }

    fn neigh_global(&self, shire: usize, neigh: usize) -> usize {
        shire * 4 + neigh
    }

    fn core_hart0(&self, core: CoreId) -> HartId {
        core.hart(0)
    }

    /// Resolve the `0xFF` "local" shire sentinel against the issuing
    /// hart's own shire; a local address with no hart
    /// context is illegal.
    fn resolve_shire(&self, d: &EsrAddr, issuer: Option<HartId>) -> Result<usize, Trap> {
        if d.shire == SHIRE_LOCAL {
            issuer
                .map(|h| self.topology.shire_of_hart(h) as usize)
                .ok_or(Trap::MemoryError(0))
        } else {
            Ok(d.shire as usize)
        }
    }

    // ---------------------------------------------------------------
    // ESR read/write
    // ---------------------------------------------------------------

    /// Full ESR read including side effects (RESET_CAUSE read-and-clear,
    /// SPIN_LOCK test-and-set, WATCHDOG fixed zero, AND/OR tree
    /// computation, live HASTATUS0/1 reflection).
    pub fn esr_read(&mut self, issuer: Option<HartId>, addr: u64) -> Result<u64, Trap> {
        let offset = addr - pma::ESR_BASE;
        let d = esr::decode(offset).map_err(|_| Trap::SysregError(addr))?;
        let shire = self.resolve_shire(&d, issuer)?;

        match (d.subregion, d.field) {
            (SubRegion::Hart, f) if f == fields::hart_field::HASTATUS0 => {
                let h = &self.harts[d.entity as usize];
                let mut v = 0u64;
                v |= (h.state == HartState::Halted) as u64;
                v |= ((h.state == HartState::Running) as u64) << 1;
                v |= (h.resumeack as u64) << 2;
                v |= (h.havereset as u64) << 3;
                v |= ((h.state == HartState::Unavailable) as u64) << 4;
                return Ok(v);
            }
            (SubRegion::ShireOther, f) if f == fields::shire_other_field::RESET_CAUSE => {
                let v = self.reset_cause as u64;
                self.reset_cause = 0;
                return Ok(v);
            }
            (SubRegion::ShireOther, f) if f == fields::shire_other_field::SPIN_LOCK => {
                let v = self.spin_lock;
                self.spin_lock |= 1;
                return Ok(v);
            }
            (SubRegion::ShireOther, f) if f == fields::shire_other_field::WATCHDOG => {
                return Ok(self.watchdog.read());
            }
            (SubRegion::ShireOther, f) if f == fields::shire_other_field::PLL_LOCK_STATUS => {
                return Ok(1); // PLL read-data is a hard-coded "locked" value; clock/PLL modeling is out of scope.
            }
            (SubRegion::Neigh, f) if f == fields::neigh_field::ANDORTREE_L0 => {
                let harts: Vec<&Hart> = self.harts_in_neighborhood(shire, d.entity as usize);
                return Ok(self.debug.andortree_l0(&harts) as u64);
            }
            (SubRegion::ShireOther, f) if f == fields::shire_other_field::ANDORTREE_L1 => {
                let children: Vec<u16> = (0..4)
                    .map(|n| self.debug.andortree_l0(&self.harts_in_neighborhood(shire, n)))
                    .collect();
                return Ok(DebugModule::combine_levels(&children) as u64);
            }
            (SubRegion::Rbox, f) if f == fields::rbox_field::ANDORTREE_L2 => {
                let compute_shires: Vec<usize> = self
                    .topology
                    .shires
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.kind == ShireKind::Compute)
                    .map(|(i, _)| i)
                    .collect();
                let children: Vec<u16> = compute_shires
                    .iter()
                    .map(|&sh| {
                        let l1: Vec<u16> = (0..4)
                            .map(|n| self.debug.andortree_l0(&self.harts_in_neighborhood(sh, n)))
                            .collect();
                        DebugModule::combine_levels(&l1)
                    })
                    .collect();
                return Ok(DebugModule::combine_levels(&children) as u64);
            }
            (SubRegion::Hart, f) if f == fields::hart_field::DMCTRL => {
                return Ok(self.debug.read_dmctrl() as u64);
            }
            _ => {}
        }

        self.esr_plane_mut()
            .read_raw(&d, shire)
            .map_err(|_| Trap::SysregError(addr))
    }

    fn harts_in_neighborhood(&self, shire: usize, neigh: usize) -> Vec<&Hart> {
        let desc = &self.topology.shires[shire];
        let neigh_base_core = desc.core_base + neigh as u32 * crate::topology::MINIONS_PER_NEIGHBORHOOD;
        let neigh_end_core = neigh_base_core + crate::topology::MINIONS_PER_NEIGHBORHOOD;
        (neigh_base_core..neigh_end_core)
            .flat_map(|c| [CoreId(c).hart(0), CoreId(c).hart(1)])
            .map(|h| &self.harts[h.0 as usize])
            .collect()
    }

    /// Full ESR write including side effects. `issuer` is
    /// `None` for loader/debugger-originated writes (no local-shire
    /// resolution, no privilege check).
    pub fn esr_write(&mut self, issuer: Option<HartId>, addr: u64, value: u64) -> Result<(), Trap> {
        let offset = addr - pma::ESR_BASE;
        let d = esr::decode(offset).map_err(|_| Trap::SysregError(addr))?;

        if let Some(h) = issuer {
            let cur = self.harts[h.0 as usize].mode as u8;
            // Privilege field: 0=U,1=S,3=M (mirrors mstatus encoding). The
            // only rule enforced is required mode <= current mode.
            let req = d.privilege;
            let cur_rank = match cur {
                x if x == Mode::User as u8 => 0,
                x if x == Mode::Supervisor as u8 => 1,
                _ => 2,
            };
            let req_rank = match req {
                0 => 0,
                1 => 1,
                _ => 2,
            };
            if req_rank > cur_rank {
                return Err(Trap::MemoryError(addr));
            }
        }

        let shire = self.resolve_shire(&d, issuer)?;

        // Broadcast-to-neighborhoods: a write addressed to NEIGH_BROADCAST
        // fans out to all four neighborhoods of the target shire.
        if matches!(d.subregion, SubRegion::Neigh) && d.entity == NEIGH_BROADCAST {
            for n in 0..4u16 {
                let mut d2 = d;
                d2.entity = n;
                self.apply_esr_write(issuer, &d2, shire, value)?;
            }
            return Ok(());
        }

        // {U,S,M}BROADCAST: replicate BROADCAST_DATA to a decoded target
        // address on every shire whose bit is set in the low 40 bits of
        // `value`; the target's subregion/entity/field (the address sans
        // shire and privilege) is carried in the remaining bits of `value`
        // itself, mirroring `decode_broadcast_esr_value` in the original.
        if matches!(d.subregion, SubRegion::Rbox) && d.field == fields::rbox_field::BROADCAST_DATA + 1 {
            let shire_mask = value & 0xFF_FFFF_FFFF;
            let local_offset = (value >> 40) & 0x3F_FFFF;
            let data = self.broadcast_data;
            for sh in 0..self.topology.shires.len() {
                if shire_mask & (1u64 << sh) == 0 {
                    continue;
                }
                let target_offset =
                    local_offset | ((sh as u64 & 0xFF) << 22) | ((d.privilege as u64) << 30);
                let target_addr = pma::ESR_BASE + target_offset;
                self.esr_write(issuer, target_addr, data)?;
            }
            return Ok(());
        }

        self.apply_esr_write(issuer, &d, shire, value)
    }

    fn apply_esr_write(
        &mut self,
        issuer: Option<HartId>,
        d: &EsrAddr,
        shire: usize,
        value: u64,
    ) -> Result<(), Trap> {
        use fields::{hart_field, neigh_field, rbox_field, shire_other_field};

        match d.subregion {
            SubRegion::Rbox if d.field == rbox_field::BROADCAST_DATA => {
                self.broadcast_data = value;
            }
            SubRegion::Hart if d.field == hart_field::DMCTRL => {
                let reset_pc = self.config.reset_pc;
                let topology = &self.topology;
                let effect = self.debug.write_dmctrl(value as u32, &mut self.harts, reset_pc, |id| {
                    topology.shires[topology.shire_of_hart(id) as usize].kind == ShireKind::Compute
                });
                if effect == DmCtrlEffect::MultipleRequestBits {
                    log::warn!("dmctrl write set more than one request bit at once");
                }
                if matches!(
                    effect,
                    DmCtrlEffect::HartsResumed | DmCtrlEffect::DebugModuleReset
                ) {
                    for h in self.harts.iter().filter(|h| h.state == HartState::Running) {
                        self.scheduler.activate(h.id);
                    }
                }
            }
            SubRegion::Hart if d.field == hart_field::HARTSEL => self.debug.hartsel = value as u32,
            SubRegion::Hart if d.field == hart_field::HAWINDOW => self.debug.hawindow = value,
            SubRegion::Hart if d.field == hart_field::HARTMASK => self.debug.hartmask = value,
            SubRegion::Hart if d.field == hart_field::NXPROGBUF0 => {
                if let Some(h) = self.harts.get_mut(d.entity as usize) {
                    debug::start_progbuf(h);
                }
            }
            SubRegion::Hart if d.field == hart_field::EXCL_MODE => {
                if let Some(hart) = self.harts.get(d.entity as usize) {
                    let core = hart.id.core();
                    if let Some(c) = self.cores.get_mut(core.0 as usize) {
                        if value != 0 {
                            c.excl_mode = 1 + (((hart.id.0 & 1) as u8) << 1);
                        } else {
                            c.excl_mode = 0;
                            let sibling = HartId(hart.id.0 ^ 1);
                            if let Some(s) = self.harts.get_mut(sibling.0 as usize) {
                                if s.state == HartState::Blocked {
                                    s.state = HartState::Running;
                                    self.scheduler.wake(sibling);
                                }
                            }
                        }
                    }
                }
            }
            SubRegion::Neigh if d.field == neigh_field::MINION_FEATURE => {
                self.apply_minion_feature(shire, d.entity as usize, value);
            }
            SubRegion::Neigh if d.field == neigh_field::IPI_TRIGGER => {
                self.apply_ipi(shire, d.entity as usize, value, true);
            }
            SubRegion::Neigh if d.field == neigh_field::IPI_TRIGGER_CLEAR => {
                self.apply_ipi(shire, d.entity as usize, value, false);
            }
            SubRegion::Neigh if d.field == neigh_field::IPI_REDIRECT_TRIGGER => {
                self.apply_ipi_redirect(shire, d.entity as usize, value)?;
            }
            SubRegion::Neigh if d.field == neigh_field::MCACHE_CONTROL
                || d.field == neigh_field::UCACHE_CONTROL =>
            {
                self.apply_cache_control(shire, d.entity as usize, value as u8);
            }
            SubRegion::Neigh if d.field == neigh_field::MPROT => {
                self.apply_mprot(shire, d.entity as usize, value);
            }
            SubRegion::ShireOther if d.field == shire_other_field::SHIRE_COOP_MODE => {
                // SHIRE_COOP_MODE = 0 cancels any active icache prefetches
                //; this chip models no separate icache
                // prefetch state beyond the per-hart fetch cache, so the
                // effect is a no-op invalidation of that cache.
                if value == 0 {
                    for core_idx in self.topology.shires[shire].core_base
                        ..self.topology.shires[shire].core_base + self.topology.shires[shire].core_count
                    {
                        for t in 0..2 {
                            let hid = CoreId(core_idx).hart(t);
                            if let Some(h) = self.harts.get_mut(hid.0 as usize) {
                                h.invalidate_fetch_cache();
                            }
                        }
                    }
                }
            }
            SubRegion::ShireOther if d.field == shire_other_field::WATCHDOG => {
                self.watchdog.write(value);
            }
            _ => {
                self.esr_plane_mut()
                    .write_raw(d, shire, value)
                    .map_err(|_| Trap::SysregError(0))?;
                return Ok(());
            }
        }

        // Fields handled above that also need their raw value retained for
        // plain read-back (e.g. HARTSEL has no live side-effect read path)
        // still get stored.
        let _ = self.esr_plane_mut().write_raw(d, shire, value);
        let _ = issuer;
        Ok(())
    }

    /// Boot-time hart enable/disable (CLI surface "enable/disable
    /// harts"), independent of a guest `MINION_FEATURE` ESR write. Only
    /// thread 1 of a minion can be toggled this way; thread 0 and the I/O
    /// shire's single hart are always present.
    pub fn set_hart_enabled(&mut self, id: HartId, enabled: bool) {
        if id.thread() != 1 {
            return;
        }
        match (enabled, self.harts[id.0 as usize].state) {
            (false, HartState::Running) | (false, HartState::Waiting(_)) => {
                self.harts[id.0 as usize].state = HartState::Unavailable;
                self.scheduler.retire_sleeping(id);
            }
            (true, HartState::Unavailable) => {
                self.harts[id.0 as usize].state = HartState::Running;
                self.scheduler.activate(id);
            }
            _ => {}
        }
    }

    fn apply_minion_feature(&mut self, shire: usize, neigh: usize, value: u64) {
        let desc = &self.topology.shires[shire];
        let neigh_base_core = desc.core_base + neigh as u32 * crate::topology::MINIONS_PER_NEIGHBORHOOD;
        for i in 0..crate::topology::MINIONS_PER_NEIGHBORHOOD {
            let core = CoreId(neigh_base_core + i);
            let hart1 = core.hart(1);
            let thread1_disable = value & (1 << i) != 0;
            if let Some(h) = self.harts.get_mut(hart1.0 as usize) {
                match (thread1_disable, h.state) {
                    (true, HartState::Running) | (true, HartState::Waiting(_)) => {
                        h.state = HartState::Unavailable;
                        self.scheduler.retire_sleeping(hart1);
                    }
                    (false, HartState::Unavailable) => {
                        h.state = HartState::Running;
                        self.scheduler.activate(hart1);
                    }
                    _ => {}
                }
            }
        }
    }

    fn apply_ipi(&mut self, shire: usize, neigh: usize, mask: u64, set: bool) {
        const MSIP_BIT: u64 = 1 << 3;
        for h in self.harts_in_neighborhood_ids(shire, neigh) {
            if mask & (1u64 << (h.0 % 16)) == 0 {
                continue;
            }
            if let Some(hart) = self.harts.get_mut(h.0 as usize) {
                if set {
                    hart.mip |= MSIP_BIT;
                    if hart.state.is_waiting_on(wait_kind::INTERRUPT) && hart.pending_enabled_interrupt() {
                        hart.state = HartState::Running;
                        self.scheduler.wake(h);
                    }
                } else {
                    hart.mip &= !MSIP_BIT;
                }
            }
        }
    }

    fn harts_in_neighborhood_ids(&self, shire: usize, neigh: usize) -> Vec<HartId> {
        let desc = &self.topology.shires[shire];
        let neigh_base_core = desc.core_base + neigh as u32 * crate::topology::MINIONS_PER_NEIGHBORHOOD;
        (neigh_base_core..neigh_base_core + crate::topology::MINIONS_PER_NEIGHBORHOOD)
            .flat_map(|c| [CoreId(c).hart(0), CoreId(c).hart(1)])
            .collect()
    }

    /// IPI_REDIRECT_TRIGGER: "for a user-mode hart that is
    /// `Waiting(interrupt)` jumps the hart's PC to `IPI_REDIRECT_PC` and
    /// wakes it; for any other hart state it raises a dedicated 'bad IPI
    /// redirect' interrupt." `trigger & IPI_REDIRECT_FILTER` selects harts
    /// within the neighborhood by bit index (this chip's documented
    /// encoding decision, see DESIGN.md).
    fn apply_ipi_redirect(&mut self, shire: usize, neigh: usize, trigger: u64) -> Result<(), Trap> {
        let filter = self
            .esr_plane_mut()
            .read_raw(
                &EsrAddr {
                    privilege: 0,
                    shire: shire as u16,
                    subregion: SubRegion::Neigh,
                    entity: neigh as u16,
                    field: fields::neigh_field::IPI_REDIRECT_FILTER,
                },
                shire,
            )
            .unwrap_or(u64::MAX);
        let redirect_pc = self
            .esr_plane_mut()
            .read_raw(
                &EsrAddr {
                    privilege: 0,
                    shire: shire as u16,
                    subregion: SubRegion::Neigh,
                    entity: neigh as u16,
                    field: fields::neigh_field::IPI_REDIRECT_PC,
                },
                shire,
            )
            .unwrap_or(0);

        let selected = trigger & filter;
        let harts = self.harts_in_neighborhood_ids(shire, neigh);
        for h in harts {
            if selected & (1u64 << (h.0 % 16)) == 0 {
                continue;
            }
            let hart = &mut self.harts[h.0 as usize];
            if hart.state.is_waiting_on(wait_kind::INTERRUPT) && hart.mode == Mode::User {
                hart.npc = redirect_pc;
                hart.pc = redirect_pc;
                hart.state = HartState::Running;
                self.scheduler.wake(h);
            } else {
                hart.raise_interrupt_bit(1 << 12); // dedicated "bad IPI redirect" line
            }
        }
        Ok(())
    }

    /// Propagates an `MPROT` write to every core in the neighborhood, since
    /// the guard window it controls is shared by the whole neighborhood's SP
    /// region, mirroring `apply_cache_control`'s fan-out.
    fn apply_mprot(&mut self, shire: usize, neigh: usize, value: u64) {
        let desc = &self.topology.shires[shire];
        let neigh_base_core = desc.core_base + neigh as u32 * crate::topology::MINIONS_PER_NEIGHBORHOOD;
        for i in 0..crate::topology::MINIONS_PER_NEIGHBORHOOD {
            let core_idx = (neigh_base_core + i) as usize;
            if let Some(core) = self.cores.get_mut(core_idx) {
                core.mprot = value;
            }
        }
    }

    fn apply_cache_control(&mut self, shire: usize, neigh: usize, new_mode: u8) {
        let desc = &self.topology.shires[shire];
        let neigh_base_core = desc.core_base + neigh as u32 * crate::topology::MINIONS_PER_NEIGHBORHOOD;
        for i in 0..crate::topology::MINIONS_PER_NEIGHBORHOOD {
            let core_idx = (neigh_base_core + i) as usize;
            if let Some(core) = self.cores.get_mut(core_idx) {
                let coop_in_flight = core.tload.state() == crate::tensor::tload::TLoadState::WaitingCoop
                    || core.tload.state() == crate::tensor::tload::TLoadState::Loading;
                if core.apply_cache_mode(new_mode, coop_in_flight) {
                    log::error!(
                        "fatal invariant violation: scratchpad disabled during in-flight cooperative tensor load (core {core_idx})"
                    );
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Hart execution cycle
    // ---------------------------------------------------------------

    fn fetch(&mut self, id: HartId) -> Result<(Inst, bool, u32), Trap> {
        let mprot = self
            .cores
            .get(id.core().0 as usize)
            .map(|c| c.mprot)
            .unwrap_or(0);
        let hart = &mut self.harts[id.0 as usize];
        let pc = hart.pc;
        let mode = hart.mode;
        let atp = mmu::Atp::decode(hart.satp);
        let pa = mmu::translate(&self.mem, &mut hart.tlb, hart.mode, atp, hart.mstatus, pc, AccessType::Instruction)?;
        let checked = pma::check_access(pa, 4, AccessType::Instruction, false, is_sp_hart(&self.topology, id), mprot, mode)?;

        let word = if let Some(cached) = hart.fetch_cache_lookup(checked.addr) {
            let off = (checked.addr % crate::hart::FETCH_BUF_SIZE as u64) as usize;
            u32::from_le_bytes([
                cached[off],
                *cached.get(off + 1).unwrap_or(&0),
                *cached.get(off + 2).unwrap_or(&0),
                *cached.get(off + 3).unwrap_or(&0),
            ])
        } else {
            let base = checked.addr & !((crate::hart::FETCH_BUF_SIZE as u64) - 1);
            let mut buf = [0u8; crate::hart::FETCH_BUF_SIZE];
            self.mem
                .read(Agent::Hart(id), base, &mut buf)
                .map_err(|_| Trap::InstructionAccessFault(pc))?;
            hart.fetch_cache_fill(base, buf);
            let off = (checked.addr - base) as usize;
            u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
        };

        let (inst, is_compressed) = isa::decode(word, word & 0x3 != 0x3)?;
        Ok((inst, is_compressed, word))
    }

    /// Breakpoint match: address compare with
    /// `tdata2`, gated by `tdata1` bit 0 ("enabled") and bit 1
    /// ("action": 0 = trap, 1 = enter debug mode directly).
    fn check_breakpoint(&self, id: HartId, pc: u64) -> Option<bool> {
        let hart = &self.harts[id.0 as usize];
        if hart.debug.tdata1 & 1 == 0 {
            return None;
        }
        if hart.debug.tdata2 != pc {
            return None;
        }
        Some(hart.debug.tdata1 & 2 != 0)
    }

    /// One scheduler-tick instruction slot for `id`.
    fn step_hart(&mut self, id: HartId) {
        self.async_execute(id);

        let state = self.harts[id.0 as usize].state;
        if state == HartState::Blocked {
            return;
        }
        if state == HartState::Halted {
            if self.harts[id.0 as usize].progbuf.active {
                self.run_progbuf_step(id);
            }
            return;
        }

        self.check_pending_interrupts(id);
        if matches!(self.harts[id.0 as usize].state, HartState::Waiting(_)) {
            return;
        }
        if self.harts[id.0 as usize].state != HartState::Running {
            return;
        }

        let pc = self.harts[id.0 as usize].pc;
        if let Some(enter_debug) = self.check_breakpoint(id, pc) {
            if enter_debug {
                self.enter_debug_mode(id, DebugCause::TriggerMatch);
            } else {
                self.deliver_trap(id, Trap::Breakpoint);
            }
            return;
        }

        match self.fetch(id) {
            Ok((inst, is_compressed, _)) => self.run_one(id, inst, is_compressed),
            Err(e) => self.handle_exception(id, e),
        }
    }

    fn run_one(&mut self, id: HartId, inst: Inst, is_compressed: bool) {
        let core_id = id.core();
        let size = if is_compressed { 2 } else { 4 };
        let sp = is_sp_hart(&self.topology, id);
        let minion_feature_enabled = true;

        self.harts[id.0 as usize].npc = self.harts[id.0 as usize].pc.wrapping_add(size);

        let (hart, core) = self.hart_core_mut(id, core_id);
        let result = isa::execute(inst, hart, core, &mut self.mem, sp, minion_feature_enabled);

        match result {
            Ok(Some(start)) => {
                self.advance_pc(id);
                self.apply_tensor_start(id, start);
            }
            Ok(None) => {
                self.advance_pc(id);
            }
            Err(e) => self.handle_exception(id, e),
        }
        self.sync_wait_state(id);
    }

    /// Moves a hart onto the scheduler's `sleeping` list the moment its
    /// state becomes `Waiting(_)`, wherever that transition happens
    /// (`wfi`, a busy tensor FSM, or a `TENSOR_WAIT` that parks instead of
    /// restarting). Without this the hart stays on `active` forever and
    /// `run()`'s termination check never sees it as asleep.
    fn sync_wait_state(&mut self, id: HartId) {
        if matches!(self.harts[id.0 as usize].state, HartState::Waiting(_)) {
            self.scheduler.start_waiting(id);
        }
    }

    fn hart_core_mut(&mut self, id: HartId, core_id: CoreId) -> (&mut Hart, &mut Core) {
        (&mut self.harts[id.0 as usize], &mut self.cores[core_id.0 as usize])
    }

    fn advance_pc(&mut self, id: HartId) {
        let hart = &mut self.harts[id.0 as usize];
        hart.pc = hart.npc;
    }

    fn handle_exception(&mut self, id: HartId, e: Trap) {
        match e {
            Trap::InstructionRestart => {
                // Leave `pc` untouched; next tick re-fetches the same
                // instruction.
            }
            Trap::DebugEntry(cause) => self.enter_debug_mode(id, cause),
            Trap::MemoryError(addr) => {
                self.harts[id.0 as usize].raise_interrupt_bit(1 << 13); // bus-error interrupt line
                log::warn!("hart {}: bus error at {addr:#x}", id.0);
            }
            other => self.deliver_trap(id, other),
        }
    }

    /// `take_trap`: writes `mepc`/`mcause`/`mtval`, flips `prv`,
    /// and sets `pc := mtvec[base + 4*cause]` (vectored if `mtvec[0]=1`).
    fn deliver_trap(&mut self, id: HartId, trap: Trap) {
        if self.harts[id.0 as usize].progbuf.active {
            debug::progbuf_exception(&mut self.harts[id.0 as usize], DebugCause::ProgramBufferException);
            return;
        }
        let Some((is_interrupt, cause, tval)) = trap.cause_tval() else {
            log::error!("fatal exception escaped take_trap: {trap}");
            self.done = Some(StopReason::Fail);
            return;
        };

        let hart = &mut self.harts[id.0 as usize];
        let cause_bit = if is_interrupt { 1u64 << 63 } else { 0 };
        let delegated = if is_interrupt { hart.mideleg } else { hart.medeleg };
        let to_s = hart.mode != Mode::Machine && (delegated >> cause) & 1 != 0;

        if to_s {
            hart.sepc = hart.pc;
            hart.scause = cause | cause_bit;
            hart.stval = tval;
            let spie = (hart.mstatus >> 1) & 1;
            hart.mstatus = (hart.mstatus & !(1 << 5)) | (spie << 5);
            hart.mstatus &= !(1 << 1);
            hart.mstatus = (hart.mstatus & !(1 << 8)) | (((hart.mode == Mode::Supervisor) as u64) << 8);
            hart.mode = Mode::Supervisor;
            hart.pc = vectored_target(hart.stvec, cause, is_interrupt);
        } else {
            hart.mepc = hart.pc;
            hart.mcause = cause | cause_bit;
            hart.mtval = tval;
            let mpie = (hart.mstatus >> 3) & 1;
            hart.mstatus = (hart.mstatus & !(1 << 7)) | (mpie << 7);
            hart.mstatus &= !(1 << 3);
            let mpp = hart.mode as u64;
            hart.mstatus = (hart.mstatus & !(0x3 << 11)) | (mpp << 11);
            hart.mode = Mode::Machine;
            hart.pc = vectored_target(hart.mtvec, cause, is_interrupt);
        }
        hart.npc = hart.pc;
    }

    fn enter_debug_mode(&mut self, id: HartId, cause: DebugCause) {
        let hart = &mut self.harts[id.0 as usize];
        hart.debug.dpc = hart.pc;
        hart.in_debug_mode = true;
        hart.state = HartState::Halted;
        let _ = cause;
        self.scheduler.retire_sleeping(id);
    }

    fn run_progbuf_step(&mut self, id: HartId) {
        use crate::debug::ProgBufStep;
        match debug::advance_progbuf(&mut self.harts[id.0 as usize]) {
            ProgBufStep::Instruction0 | ProgBufStep::Instruction1 => {
                let pc = self.harts[id.0 as usize].pc;
                match self.fetch_raw_at(pc) {
                    Ok(word) => {
                        if let Ok((inst, _, _)) = isa::decode(word, false).map(|(i, c)| (i, c, word)) {
                            self.run_one(id, inst, false);
                        }
                    }
                    Err(_) => self.deliver_trap(id, Trap::InstructionAccessFault(pc)),
                }
            }
            ProgBufStep::Ebreak | ProgBufStep::Done => {}
        }
    }

    fn fetch_raw_at(&self, pc: u64) -> Result<u32, Trap> {
        let mut buf = [0u8; 4];
        self.mem
            .read(Agent::Debugger, pc, &mut buf)
            .map_err(|_| Trap::InstructionAccessFault(pc))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Wakes a hart parked on `Waiting(interrupt)` once an enabled
    /// interrupt becomes pending.
    fn check_pending_interrupts(&mut self, id: HartId) {
        let hart = &mut self.harts[id.0 as usize];
        if hart.state.is_waiting_on(wait_kind::INTERRUPT) && hart.pending_enabled_interrupt() {
            hart.state = HartState::Running;
            self.scheduler.wake(id);
        }
    }

    // ---------------------------------------------------------------
    // Tensor coprocessor dispatch
    // ---------------------------------------------------------------

    fn apply_tensor_start(&mut self, id: HartId, start: isa::TensorStart) {
        if let Some((tcoop, minion_bit)) = start.coop {
            let shire = self.topology.shire_of_hart(id) as usize;
            for n in crate::tensor::coop::neighborhoods_in_mask(tcoop.neigh_mask) {
                let leader = self.neigh_global(shire, n as usize);
                let released = self.coop.arrive(leader, CoopOperand::A0, tcoop.group, tcoop.minion_mask, minion_bit);
                if released {
                    self.release_cooperative_group(shire, n as usize, tcoop.minion_mask);
                }
            }
        }
        let _ = start.kind;
    }

    fn release_cooperative_group(&mut self, shire: usize, neigh: usize, minion_mask: u32) {
        let desc = &self.topology.shires[shire];
        let neigh_base_core = desc.core_base + neigh as u32 * crate::topology::MINIONS_PER_NEIGHBORHOOD;
        for i in 0..crate::topology::MINIONS_PER_NEIGHBORHOOD {
            if minion_mask & (1 << i) == 0 {
                continue;
            }
            let core_idx = (neigh_base_core + i) as usize;
            if let Some(core) = self.cores.get_mut(core_idx) {
                core.tload.release_cooperative();
            }
        }
    }

    /// Advance the ready coprocessor FSMs for this hart's core.
    fn async_execute(&mut self, id: HartId) {
        let core_id = id.core();
        let sp = is_sp_hart(&self.topology, id);

        self.step_tload(id, core_id, sp);
        self.step_tstore(id, core_id, sp);
        self.step_tquant(id, core_id);
        self.step_tfma(id, core_id);
        self.step_treduce(id, core_id);
    }

    /// Advances a `Loading` TensorLoad by one row: reads `VLEN_BYTES` from
    /// the source virtual address into the destination scratchpad row,
    /// copying 16 VLEN-wide rows from virtual memory into L1 scratchpad
    /// rows in total. A masked-out row (`tensor_mask` suppresses it) is
    /// skipped but still advances the row counter. A trap ends the op and
    /// sets `tensor_error[7]`; a bus error raises the hart's bus-error
    /// interrupt and continues to the next row.
    fn step_tload(&mut self, id: HartId, core_id: CoreId, sp: bool) {
        use crate::hart::VLEN_BYTES;
        use crate::tensor::tload::TLoadState;
        let is_head = self.cores[core_id.0 as usize].head_of_line() == Some(TensorOpKind::Load);
        if !is_head {
            return;
        }
        if self.cores[core_id.0 as usize].tload.state() == TLoadState::Ready {
            self.cores[core_id.0 as usize].tload.begin_loading();
        }
        if self.cores[core_id.0 as usize].tload.state() != TLoadState::Loading {
            return;
        }

        let (params, rows_done) = {
            let d = self.cores[core_id.0 as usize]
                .tload
                .state_
                .expect("Loading state implies params are present");
            (d.params, d.rows_done)
        };
        let masked_out = (params.mask >> rows_done) & 1 == 0;
        let va = params.addr + rows_done as u64 * VLEN_BYTES as u64;

        if !masked_out {
            let mprot = self.cores[core_id.0 as usize].mprot;
            let mut buf = [0u8; VLEN_BYTES];
            let hart = &mut self.harts[id.0 as usize];
            let mode = hart.effective_data_mode();
            let atp = mmu::Atp::decode(hart.satp);
            let result = mmu::translate(&self.mem, &mut hart.tlb, mode, atp, hart.mstatus, va, AccessType::Load)
                .and_then(|pa| pma::check_access(pa, VLEN_BYTES as u8, AccessType::Load, false, sp, mprot, mode))
                .and_then(|checked| {
                    self.mem
                        .read(Agent::Hart(id), checked.addr, &mut buf)
                        .map_err(|_| Trap::MemoryError(checked.addr))
                });

            match result {
                Ok(()) => {
                    let row = self.cores[core_id.0 as usize].tload.step_row();
                    if let Some(r) = row {
                        let row_idx = if params.tenb { 32 + r as usize } else { r as usize };
                        self.cores[core_id.0 as usize].scratchpad[row_idx] = buf;
                    } else {
                        self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Load);
                    }
                    return;
                }
                Err(Trap::MemoryError(addr)) => {
                    self.harts[id.0 as usize].raise_interrupt_bit(1 << 13); // bus-error interrupt line
                    let row = self.cores[core_id.0 as usize].tload.step_row();
                    if row.is_none() {
                        self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Load);
                    }
                    return;
                }
                Err(_) => {
                    self.cores[core_id.0 as usize].tensor_error |= crate::tensor::tensor_error_bit::LOAD_TRAP;
                    self.cores[core_id.0 as usize].tload.abort();
                    self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Load);
                    return;
                }
            }
        }

        let row = self.cores[core_id.0 as usize].tload.step_row();
        if row.is_none() {
            self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Load);
        }
    }

    fn step_tstore(&mut self, _id: HartId, core_id: CoreId, _sp: bool) {
        let is_head = self.cores[core_id.0 as usize].head_of_line() == Some(TensorOpKind::Store);
        if !is_head {
            return;
        }
        let done = {
            let core = &mut self.cores[core_id.0 as usize];
            core.tstore.step_row().is_none()
        };
        if done {
            self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Store);
        }
    }

    fn step_tquant(&mut self, _id: HartId, core_id: CoreId) {
        if self.cores[core_id.0 as usize].head_of_line() != Some(TensorOpKind::Quant) {
            return;
        }
        if self.cores[core_id.0 as usize].tquant.execute().is_some() {
            self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Quant);
        }
    }

    fn step_tfma(&mut self, _id: HartId, core_id: CoreId) {
        if self.cores[core_id.0 as usize].head_of_line() != Some(TensorOpKind::Fma) {
            return;
        }
        use crate::tensor::tfma::TFmaState;
        if self.cores[core_id.0 as usize].tfma.state() != TFmaState::Ready {
            return;
        }
        if let Some(issuer) = self.cores[core_id.0 as usize].tfma.issuer() {
            self.compute_fma(issuer);
        }
        let err = self.cores[core_id.0 as usize].tfma.execute();
        self.cores[core_id.0 as usize].tensor_error |= err;
        self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Fma);
    }

    fn step_treduce(&mut self, id: HartId, core_id: CoreId) {
        if self.cores[core_id.0 as usize].head_of_line() != Some(TensorOpKind::Reduce) {
            return;
        }
        let Some(params) = self.cores[core_id.0 as usize].treduce.params() else {
            return;
        };
        let partner_core = params.partner.core();
        if partner_core.0 as usize >= self.cores.len() {
            return;
        }
        self.cores[core_id.0 as usize].treduce.promote_to_head();

        let (a, b) = if core_id.0 < partner_core.0 {
            let (left, right) = self.cores.split_at_mut(partner_core.0 as usize);
            (&mut left[core_id.0 as usize], &mut right[0])
        } else if core_id.0 > partner_core.0 {
            let (left, right) = self.cores.split_at_mut(core_id.0 as usize);
            (&mut right[0], &mut left[partner_core.0 as usize])
        } else {
            return;
        };

        use crate::tensor::treduce::TReduceState;
        let a_is_receiver = a.treduce.state() == TReduceState::ReadyToReceive;
        let (receiver, sender) = if a_is_receiver { (&a.treduce, &b.treduce) } else { (&b.treduce, &a.treduce) };
        let transfer = receiver.params().zip(receiver.self_id()).zip(sender.self_id()).map(
            |((params, receiver_id), sender_id)| (params, receiver_id, sender_id),
        );

        let completed = if core_id.0 < partner_core.0 {
            a.treduce.try_complete(&mut b.treduce)
        } else {
            b.treduce.try_complete(&mut a.treduce)
        };
        if completed {
            self.cores[core_id.0 as usize].dequeue_if_head(TensorOpKind::Reduce);
            if let Some((params, receiver_id, sender_id)) = transfer {
                self.apply_reduce_transfer(params, receiver_id, sender_id);
            }
            let _ = id;
        }
    }

    /// Applies the actual register transfer between `count` consecutive
    /// registers starting at `src_reg` (sender) and `dst_reg` (receiver),
    /// per `op`.
    fn apply_reduce_transfer(&mut self, params: crate::tensor::treduce::TReduceParams, receiver_id: HartId, sender_id: HartId) {
        let (lo, hi) = if receiver_id.0 < sender_id.0 { (receiver_id, sender_id) } else { (sender_id, receiver_id) };
        let (left, right) = self.harts.split_at_mut(hi.0 as usize);
        let (receiver_hart, sender_hart) = if receiver_id.0 < sender_id.0 {
            (&mut left[lo.0 as usize], &mut right[0])
        } else {
            (&mut right[0], &mut left[lo.0 as usize])
        };
        for i in 0..params.count as usize {
            let src_idx = (params.src_reg as usize + i) % crate::hart::NUM_FREGS;
            let dst_idx = (params.dst_reg as usize + i) % crate::hart::NUM_FREGS;
            let src = sender_hart.f[src_idx];
            apply_reduce_op(params.op, &mut receiver_hart.f[dst_idx], &src);
        }
    }

    /// Starts a TensorFMA once the issuing hart's CSR-decode step has
    /// validated pairing against TenB; this chip's tensor CSR range only
    /// carries one packed operand in `a0` for `start_tensor_op`
    /// (`isa::exec`), so the richer FMA parameter set (acols/arows/bcols/
    /// type) is assembled here from the hart's x-registers by convention
    /// (a1=dims, a2=flags) before enqueueing — documented in DESIGN.md.
    pub fn start_tensor_fma(&mut self, id: HartId, params: TFmaParams) {
        let core_id = id.core();
        let core = &mut self.cores[core_id.0 as usize];
        let tenb_ready = core.tfma.take_tenb_loaded();
        let uuid = core.next_uuid();
        core.tfma.start(params, uuid, id, tenb_ready);
        core.enqueue(TensorOpKind::Fma);
    }

    /// Applies the actual matrix multiply-accumulate into the hart's
    /// tensor register file. Operands: matrix A is
    /// the core's scratchpad rows `[0..arows)`, matrix B is the TenB
    /// shadow rows `[32..32+bcols_rows)`; each row is VLEN bytes,
    /// interpreted as packed int8 lanes for `Int8AccInt32`. With
    /// `first_pass`, the accumulator starts at zero.
    fn compute_fma(&mut self, id: HartId) {
        let core_id = id.core();
        let core = &self.cores[core_id.0 as usize];
        let Some(params) = core.tfma_params() else { return };
        let hart = &mut self.harts[id.0 as usize];

        for r in 0..params.arows as usize {
            let a_row = core.scratchpad[r];
            let mut acc = [0i32; crate::hart::VLEN_BYTES / 4];
            if !params.first_pass {
                for (lane, chunk) in hart.f[r].chunks_exact(4).enumerate().take(acc.len()) {
                    acc[lane] = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
            for c in 0..(params.bcols as usize).min(acc.len()) {
                let b_row = core.scratchpad[32 + c];
                let mut sum = 0i32;
                for k in 0..params.acols as usize {
                    let a = a_row[k] as i8 as i32;
                    let b = b_row[k] as i8 as i32;
                    sum += a * b;
                }
                acc[c] += sum;
            }
            let mut out = [0u8; crate::hart::VLEN_BYTES];
            for (lane, val) in acc.iter().enumerate() {
                out[lane * 4..lane * 4 + 4].copy_from_slice(&val.to_le_bytes());
            }
            hart.f[r] = out;
        }
    }

    // ---------------------------------------------------------------
    // Scheduler tick
    // ---------------------------------------------------------------

    /// One full scheduler tick: peripheral update, splice `awaking`, run
    /// one instruction per active hart, advance the cycle counter.
    pub fn tick(&mut self) {
        self.rvtimer.tick_core_cycle();
        if self.apb_timer.tick_core_cycle() {
            self.mem
                .region_mut(0)
                .and_then(|r| if let Region::Plic(p) = r { Some(p) } else { None })
                .map(|p| p.raise(1));
        }
        self.watchdog.tick();

        self.scheduler.splice_awaking();

        for id in self.scheduler.active_snapshot() {
            self.step_hart(id);
            if let Some(done) = self.harts[id.0 as usize].sim_done.take() {
                self.done = Some(if done == crate::isa::csr::SIM_PASS_VALUE {
                    StopReason::Pass
                } else {
                    StopReason::Fail
                });
            }
            for hart in 0..self.harts.len() {
                let pending = self.rvtimer.timer_pending(hart);
                if pending {
                    self.harts[hart].raise_interrupt_bit(1 << 7);
                    if self.harts[hart].state == HartState::Running {
                        self.scheduler.activate(HartId(hart as u32));
                    }
                }
            }
        }

        self.retire_stalled_waiters();
        self.scheduler.cycle += 1;
    }

    /// Harts parked purely on `Waiting(interrupt)` with no pending work and
    /// no timer that could ever wake them are promoted to `Nonexistent`
    /// ("Cancellation/timeouts": "avoids infinite 'wfi' hangs in tests").
    /// A hart also waiting on anything else (a tensor FSM, a message port,
    /// ...) still has pending work and is left alone.
    fn retire_stalled_waiters(&mut self) {
        let timer_armed = self.apb_timer.enabled;
        for id in 0..self.harts.len() {
            let stalled = matches!(self.harts[id].state, HartState::Waiting(mask) if mask == wait_kind::INTERRUPT)
                && !timer_armed
                && self.rvtimer.mtimecmp[id] == u64::MAX;
            if stalled {
                self.harts[id].state = HartState::Nonexistent;
                self.scheduler.retire_sleeping(HartId(id as u32));
            }
        }
    }

    /// Run until PASS/FAIL, `max_cycles`, or no hart can make progress
    ///.
    pub fn run(&mut self) -> StopReason {
        loop {
            if let Some(reason) = self.done {
                return reason;
            }
            if self.scheduler.cycle >= self.config.max_cycles {
                return StopReason::MaxCycles;
            }
            if !self.scheduler.has_active() && !self.scheduler.has_sleeping() {
                return StopReason::NoProgress;
            }
            self.tick();
        }
    }
}

fn vectored_target(tvec: u64, cause: u64, is_interrupt: bool) -> u64 {
    let base = tvec & !0x3;
    if is_interrupt && tvec & 1 != 0 {
        base + 4 * cause
    } else {
        base
    }
}

/// Combines a sender's register into a receiver's register, lane by lane
/// (16 x 32-bit lanes per VLEN-wide register): `Move` overwrites, `Add`/`Min`/
/// `Max` treat lanes as `i32`, `FAdd`/`FMin`/`FMax` as `f32`.
fn apply_reduce_op(op: ReduceOp, dst: &mut crate::hart::TensorReg, src: &crate::hart::TensorReg) {
    if op == ReduceOp::Move {
        *dst = *src;
        return;
    }
    for lane in 0..dst.len() / 4 {
        let d = i32::from_le_bytes(dst[lane * 4..lane * 4 + 4].try_into().unwrap());
        let s = i32::from_le_bytes(src[lane * 4..lane * 4 + 4].try_into().unwrap());
        let result = match op {
            ReduceOp::Move => unreachable!(),
            ReduceOp::Add => d.wrapping_add(s),
            ReduceOp::Min => d.min(s),
            ReduceOp::Max => d.max(s),
            ReduceOp::FAdd => (f32::from_bits(d as u32) + f32::from_bits(s as u32)).to_bits() as i32,
            ReduceOp::FMin => f32::from_bits(d as u32).min(f32::from_bits(s as u32)).to_bits() as i32,
            ReduceOp::FMax => f32::from_bits(d as u32).max(f32::from_bits(s as u32)).to_bits() as i32,
        };
        dst[lane * 4..lane * 4 + 4].copy_from_slice(&result.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;

    fn test_chip() -> Chip {
        Chip::new(EmulatorConfig::new(1, 0))
    }

    #[test]
    fn halt_all_resume_all_via_dm() {
        let mut chip = test_chip();
        // 4 harts: shire 1 (first compute shire), minions 0-1, both threads.
        let hart_ids: Vec<HartId> = (0..4).map(|i| HartId(2 + i)).collect();
        for id in &hart_ids {
            chip.harts[id.0 as usize].state = HartState::Running;
        }
        chip.debug.hartmask = hart_ids.iter().fold(0u64, |m, h| m | (1 << h.0));

        let dmctrl_addr = pma::ESR_BASE
            + esr::encode(0, SHIRE_LOCAL, SubRegion::Hart, 0, fields::hart_field::DMCTRL);
        chip.esr_write(None, dmctrl_addr, 0x8400_0001).unwrap();
        for id in &hart_ids {
            assert_eq!(chip.harts[id.0 as usize].state, HartState::Halted);
        }

        chip.esr_write(None, dmctrl_addr, 0x4400_0001).unwrap();
        for id in &hart_ids {
            assert_eq!(chip.harts[id.0 as usize].state, HartState::Running);
        }
    }

    #[test]
    fn ipi_redirect_wakes_waiting_hart() {
        let mut chip = test_chip();
        let h1 = HartId(3); // thread 1 of minion 0, shire 1 (neigh 0)
        chip.harts[h1.0 as usize].mode = Mode::User;
        chip.harts[h1.0 as usize].state = HartState::Waiting(wait_kind::INTERRUPT);

        let shire = chip.topology.shire_of_hart(h1) as u16;
        let neigh = 0u16;
        let pc_addr = pma::ESR_BASE
            + esr::encode(0, shire, SubRegion::Neigh, neigh, fields::neigh_field::IPI_REDIRECT_PC);
        let filter_addr = pma::ESR_BASE
            + esr::encode(0, shire, SubRegion::Neigh, neigh, fields::neigh_field::IPI_REDIRECT_FILTER);
        let trig_addr = pma::ESR_BASE
            + esr::encode(0, shire, SubRegion::Neigh, neigh, fields::neigh_field::IPI_REDIRECT_TRIGGER);

        chip.esr_write(None, pc_addr, 0x1000).unwrap();
        chip.esr_write(None, filter_addr, 0xFFFF).unwrap();
        chip.esr_write(None, trig_addr, 1 << (h1.0 % 16)).unwrap();

        assert_eq!(chip.harts[h1.0 as usize].pc, 0x1000);
        assert_eq!(chip.harts[h1.0 as usize].state, HartState::Running);
    }

    #[test]
    fn cooperative_tensor_load_releases_only_when_both_arrive() {
        let mut chip = test_chip();
        let tcoop = TCoop::encode(0, 0b011, 0b0001);
        let start0 = isa::TensorStart {
            kind: TensorOpKind::Load,
            coop: Some((TCoop::decode(tcoop), 0b001)),
        };
        let start1 = isa::TensorStart {
            kind: TensorOpKind::Load,
            coop: Some((TCoop::decode(tcoop), 0b010)),
        };
        chip.cores[0].tload.start(
            crate::tensor::tload::TLoadParams {
                addr: pma::DRAM_BASE,
                rows: 16,
                start: 0,
                tenb: false,
                mode: crate::tensor::tload::TLoadMode::Raw,
                mask: 0xFFFF,
                l2scp: false,
                coop: true,
                tcoop,
            },
            0,
        );
        chip.apply_tensor_start(HartId(2), start0);
        assert_eq!(
            chip.cores[0].tload.state(),
            crate::tensor::tload::TLoadState::WaitingCoop
        );
        chip.apply_tensor_start(HartId(4), start1);
        assert_eq!(chip.cores[0].tload.state(), crate::tensor::tload::TLoadState::Ready);
    }

    #[test]
    fn pma_store_to_uncacheable_from_non_sp_traps() {
        let mut chip = test_chip();
        let id = HartId(2);
        chip.harts[id.0 as usize].state = HartState::Running;
        chip.harts[id.0 as usize].x[2] = pma::DRAM_BASE | crate::memory::dram::UNCACHEABLE_ALIAS_BIT;
        chip.harts[id.0 as usize].x[1] = 0xDEAD_BEEF;
        let inst = crate::isa::decode::Inst::Store {
            op: crate::isa::decode::StoreOp::Sd,
            rs1: 2,
            rs2: 1,
            imm: 0,
        };
        chip.run_one(id, inst, false);
        assert_eq!(chip.harts[id.0 as usize].mcause, 7); // store access fault
    }

    #[test]
    fn tensor_load_then_fma_produces_int32_sixteen() {
        use crate::tensor::tload::{TLoadMode, TLoadParams, TLoadState};

        let mut chip = test_chip();
        let id = HartId(2);
        let core_id = id.core();

        let row = [1u8; crate::hart::VLEN_BYTES];
        for r in 0..16u64 {
            chip.mem
                .write(Agent::Loader, pma::DRAM_BASE + r * crate::hart::VLEN_BYTES as u64, &row)
                .unwrap();
        }

        let load_params = TLoadParams {
            addr: pma::DRAM_BASE,
            rows: 16,
            start: 0,
            tenb: false,
            mode: TLoadMode::Raw,
            mask: 0xFFFF,
            l2scp: false,
            coop: false,
            tcoop: 0,
        };
        let uuid = chip.cores[core_id.0 as usize].next_uuid();
        chip.cores[core_id.0 as usize].tload.start(load_params, uuid);
        chip.cores[core_id.0 as usize].enqueue(TensorOpKind::Load);
        for _ in 0..17 {
            chip.step_tload(id, core_id, false);
        }
        assert_eq!(chip.cores[core_id.0 as usize].tload.state(), TLoadState::Idle);

        let setup_b_params = TLoadParams { tenb: true, ..load_params };
        let uuid = chip.cores[core_id.0 as usize].next_uuid();
        chip.cores[core_id.0 as usize].tload.start(setup_b_params, uuid);
        chip.cores[core_id.0 as usize].enqueue(TensorOpKind::Load);
        for _ in 0..17 {
            chip.step_tload(id, core_id, false);
        }
        assert_eq!(chip.cores[core_id.0 as usize].tload.state(), TLoadState::Idle);

        chip.cores[core_id.0 as usize].tfma.tenb_arrived();
        chip.start_tensor_fma(
            id,
            TFmaParams {
                acols: 16,
                arows: 16,
                bcols: 16,
                first_pass: true,
                final_pass: true,
                ty: OperandType::Int8AccInt32,
                mask: 0xFFFF,
            },
        );
        chip.step_tfma(id, core_id);

        for r in 0..16usize {
            for chunk in chip.harts[id.0 as usize].f[r].chunks_exact(4) {
                let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                assert_eq!(v, 16, "row {r}");
            }
        }
        assert_eq!(chip.cores[core_id.0 as usize].tensor_error, 0);
    }

    #[test]
    fn treduce_add_transfers_data_between_harts() {
        use crate::tensor::treduce::TReduceParams;

        let mut chip = test_chip();
        let receiver_id = HartId(2);
        let sender_id = HartId(4);
        let receiver_core = receiver_id.core();
        let sender_core = sender_id.core();

        let mut receiver_reg = [0u8; crate::hart::VLEN_BYTES];
        receiver_reg[0..4].copy_from_slice(&10i32.to_le_bytes());
        chip.harts[receiver_id.0 as usize].f[0] = receiver_reg;

        let mut sender_reg = [0u8; crate::hart::VLEN_BYTES];
        sender_reg[0..4].copy_from_slice(&5i32.to_le_bytes());
        chip.harts[sender_id.0 as usize].f[0] = sender_reg;

        let receiver_params = TReduceParams { op: ReduceOp::Add, partner: sender_id, count: 1, src_reg: 0, dst_reg: 0 };
        let sender_params = TReduceParams { op: ReduceOp::Add, partner: receiver_id, count: 1, src_reg: 0, dst_reg: 0 };

        let uuid_r = chip.cores[receiver_core.0 as usize].next_uuid();
        chip.cores[receiver_core.0 as usize].treduce.start(receiver_id, ReduceRole::Receive, receiver_params, uuid_r);
        chip.cores[receiver_core.0 as usize].enqueue(TensorOpKind::Reduce);

        let uuid_s = chip.cores[sender_core.0 as usize].next_uuid();
        chip.cores[sender_core.0 as usize].treduce.start(sender_id, ReduceRole::Send, sender_params, uuid_s);
        chip.cores[sender_core.0 as usize].enqueue(TensorOpKind::Reduce);

        chip.step_treduce(sender_id, sender_core);
        chip.step_treduce(receiver_id, receiver_core);

        let result = i32::from_le_bytes(chip.harts[receiver_id.0 as usize].f[0][0..4].try_into().unwrap());
        assert_eq!(result, 15);
    }

    #[test]
    fn breakpoint_via_tdata_traps_with_mepc_at_match() {
        let mut chip = test_chip();
        let id = HartId(2);
        let base = pma::DRAM_BASE + 0x1000;
        let bp_pc = pma::DRAM_BASE + 0x1040;

        let nop = 0x0000_0013u32.to_le_bytes();
        for i in 0..20u64 {
            chip.mem.write(Agent::Loader, base + i * 4, &nop).unwrap();
        }

        chip.harts[id.0 as usize].state = HartState::Running;
        chip.harts[id.0 as usize].pc = base;
        chip.harts[id.0 as usize].debug.tdata2 = bp_pc;
        chip.harts[id.0 as usize].debug.tdata1 = 1; // enabled, action=0 (trap)

        for _ in 0..17 {
            chip.step_hart(id);
        }

        assert_eq!(chip.harts[id.0 as usize].mepc, bp_pc);
        assert_eq!(chip.harts[id.0 as usize].mcause, 3); // breakpoint
    }

    #[test]
    fn neigh_broadcast_write_fans_out_to_all_four_neighborhoods() {
        let mut chip = test_chip();
        let shire = 1u16; // first compute shire
        let addr = |neigh: u16| {
            pma::ESR_BASE
                + esr::encode(0, shire, SubRegion::Neigh, neigh, fields::neigh_field::IPI_REDIRECT_PC)
        };
        let broadcast_addr = pma::ESR_BASE
            + esr::encode(0, shire, SubRegion::Neigh, NEIGH_BROADCAST, fields::neigh_field::IPI_REDIRECT_PC);

        chip.esr_write(None, broadcast_addr, 0x4242).unwrap();

        for neigh in 0..4u16 {
            assert_eq!(chip.esr_read(None, addr(neigh)).unwrap(), 0x4242);
        }
    }

    #[test]
    fn ubroadcast_replicates_to_every_set_shire() {
        // Two compute shires (1, 2) plus the I/O shire (0).
        let mut chip = Chip::new(EmulatorConfig::new(2, 0));

        let data_addr =
            pma::ESR_BASE + esr::encode(0, 1, SubRegion::Rbox, 0, fields::rbox_field::BROADCAST_DATA);
        chip.esr_write(None, data_addr, 0xABCD).unwrap();

        // Local offset: Neigh subregion, entity 0, field IPI_REDIRECT_PC,
        // with shire/privilege bits left at zero (those are filled in per
        // target shire by the broadcast write itself).
        let local_offset = (1u64 << 17) | (0u64 << 16) | ((fields::neigh_field::IPI_REDIRECT_PC as u64) << 3);
        let shire_mask = (1u64 << 1) | (1u64 << 2); // shires 1 and 2, not the I/O shire 0
        let value = shire_mask | (local_offset << 40);

        let ubroadcast_addr = pma::ESR_BASE
            + esr::encode(0, 1, SubRegion::Rbox, 0, fields::rbox_field::BROADCAST_DATA + 1);
        chip.esr_write(None, ubroadcast_addr, value).unwrap();

        let pc_addr = |shire: u16| {
            pma::ESR_BASE
                + esr::encode(0, shire, SubRegion::Neigh, 0, fields::neigh_field::IPI_REDIRECT_PC)
        };
        assert_eq!(chip.esr_read(None, pc_addr(1)).unwrap(), 0xABCD);
        assert_eq!(chip.esr_read(None, pc_addr(2)).unwrap(), 0xABCD);
        assert_eq!(chip.esr_read(None, pc_addr(0)).unwrap(), 0);
    }

    #[test]
    fn wfi_with_no_timer_armed_is_retired_as_nonexistent() {
        let mut chip = test_chip();
        let id = HartId(2); // shire 1 (first compute shire), minion 0, thread 0
        chip.harts[id.0 as usize].state = HartState::Waiting(wait_kind::INTERRUPT);
        chip.scheduler.start_waiting(id);

        chip.tick();

        assert_eq!(chip.harts[id.0 as usize].state, HartState::Nonexistent);
        assert!(!chip.scheduler.has_sleeping());
    }

    #[test]
    fn wfi_with_timer_armed_is_left_waiting() {
        let mut chip = test_chip();
        let id = HartId(2);
        chip.harts[id.0 as usize].state = HartState::Waiting(wait_kind::INTERRUPT);
        chip.scheduler.start_waiting(id);
        chip.rvtimer.mtimecmp[id.0 as usize] = 1_000;

        chip.tick();

        assert_eq!(chip.harts[id.0 as usize].state, HartState::Waiting(wait_kind::INTERRUPT));
    }

    #[test]
    fn waiting_on_more_than_interrupt_is_not_retired() {
        let mut chip = test_chip();
        let id = HartId(2);
        let mask = wait_kind::INTERRUPT | wait_kind::TENSOR_FMA;
        chip.harts[id.0 as usize].state = HartState::Waiting(mask);
        chip.scheduler.start_waiting(id);

        chip.tick();

        assert_eq!(chip.harts[id.0 as usize].state, HartState::Waiting(mask));
    }
}
