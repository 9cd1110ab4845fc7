//! USB transfer queueing and completion
//!
//! A transfer record owns the qTD at its slot index in the descriptor arena.
//! Control transfers use two or three records (SETUP, optional DATA,
//! STATUS) that complete as one unit: only the STATUS record goes on a
//! followup list, and it remembers the other stages. Data transfers are a
//! single record.
//!
//! Records attached to a pipe form its chain (`chain_next`), mirroring the
//! qTD links the controller follows. The chain is FIFO, so completions on a
//! pipe are dispatched in submission order.

pub mod control;
pub mod followup;

pub use control::SetupPacket;
pub use followup::{FollowupList, ListKind};

use crate::device::DeviceId;
use crate::dma::BufferHandle;
use crate::driver::DriverId;
use crate::ehci::{HostController, Pid, QueueTD};
use crate::error::{Result, UsbError};
use crate::host::HostCore;
use crate::pipe::{PipeId, PipeOwner};
use crate::pool::Handle;
use crate::timer::Timer;

/// Handle to a [`Transfer`] record
pub type TransferId = Handle<Transfer>;

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    const fn pid(self) -> Pid {
        match self {
            Self::In => Pid::In,
            Self::Out => Pid::Out,
        }
    }
}

/// Which part of a transfer a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// Control SETUP stage
    Setup,
    /// Control DATA stage
    Data,
    /// Control STATUS stage, representing the whole control transfer
    Status,
    /// Bulk or interrupt transfer
    Single,
}

/// One queued stage of data movement on a pipe
#[derive(Debug)]
pub struct Transfer {
    pub(crate) pipe: PipeId,
    pub(crate) stage: Stage,
    pub(crate) buffer: Option<BufferHandle>,
    pub(crate) length: usize,
    pub(crate) setup: Option<SetupPacket>,
    pub(crate) driver: Option<DriverId>,
    pub(crate) list: Option<ListKind>,
    pub(crate) followup_prev: Option<TransferId>,
    pub(crate) followup_next: Option<TransferId>,
    pub(crate) chain_next: Option<TransferId>,
    pub(crate) stages: [Option<TransferId>; 2],
}

impl Transfer {
    pub(crate) const fn new(pipe: PipeId, stage: Stage) -> Self {
        Self {
            pipe,
            stage,
            buffer: None,
            length: 0,
            setup: None,
            driver: None,
            list: None,
            followup_prev: None,
            followup_next: None,
            chain_next: None,
            stages: [None, None],
        }
    }

    /// Pipe the transfer runs on
    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    /// Stage described by this record
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Data buffer
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Requested byte count
    pub fn length(&self) -> usize {
        self.length
    }

    /// Setup packet of a control transfer
    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }

    /// Driver that receives the completion of a control transfer
    pub fn driver(&self) -> Option<DriverId> {
        self.driver
    }

    /// SETUP and DATA stage records of a control transfer
    pub fn stages(&self) -> [Option<TransferId>; 2] {
        self.stages
    }

    /// Followup list the record waits on
    pub fn list(&self) -> Option<ListKind> {
        self.list
    }
}

/// A finished transfer, as seen by its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    /// Record that completed (already released)
    pub transfer: TransferId,
    /// Pipe it ran on
    pub pipe: PipeId,
    /// Device the pipe belongs to
    pub device: DeviceId,
    /// Originating request of a control transfer
    pub setup: Option<SetupPacket>,
    /// Data buffer
    pub buffer: Option<BufferHandle>,
    /// Bytes requested
    pub requested: usize,
    /// Bytes moved
    pub actual: usize,
    /// Hardware outcome
    pub status: Result<()>,
}

/// Where a completion is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Default control pipe, no driver attached to the request
    Enumeration,
    /// Control request issued by a driver
    Control(DriverId),
    /// Transfer on a driver-owned pipe
    Pipe(DriverId),
}

impl<C: HostController, T: Timer> HostCore<C, T> {
    /// Queue a control transfer on the default pipe of `device`.
    ///
    /// `buffer` must hold at least `setup.length` bytes when the request has
    /// a data stage. With `driver` set, the completion goes to that driver's
    /// [`Driver::control`](crate::Driver::control) instead of the
    /// enumeration state machine.
    pub fn queue_control_transfer(
        &mut self,
        device: DeviceId,
        setup: SetupPacket,
        buffer: Option<BufferHandle>,
        driver: Option<DriverId>,
    ) -> Result<TransferId> {
        let pipe = self.devices.get(device).ok_or(UsbError::DeviceDisconnected)?.control_pipe;
        if !self.pipes.contains(pipe) {
            return Err(UsbError::InvalidState);
        }
        let length = setup.length as usize;
        let data_buffer = match buffer {
            _ if length == 0 => None,
            Some(b) if b.capacity() >= length => Some(b),
            _ => return Err(UsbError::BufferOverflow),
        };

        let setup_id = self.alloc_transfer(Transfer {
            setup: Some(setup),
            ..Transfer::new(pipe, Stage::Setup)
        })?;
        let data_id = match data_buffer {
            Some(b) => {
                let data = Transfer {
                    buffer: Some(b),
                    length,
                    ..Transfer::new(pipe, Stage::Data)
                };
                match self.alloc_transfer(data) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        self.release_transfer(setup_id);
                        return Err(e);
                    }
                }
            }
            None => None,
        };
        let status = Transfer {
            buffer: data_buffer,
            length,
            setup: Some(setup),
            driver,
            stages: [Some(setup_id), data_id],
            ..Transfer::new(pipe, Stage::Status)
        };
        let status_id = match self.alloc_transfer(status) {
            Ok(id) => id,
            Err(e) => {
                self.discard([Some(setup_id), data_id, None]);
                return Err(e);
            }
        };

        let armed = self
            .arm_control(setup_id, data_id, status_id, &setup, data_buffer)
            .and_then(|()| self.append_chain(pipe, setup_id, status_id));
        if let Err(e) = armed {
            self.discard([Some(setup_id), data_id, Some(status_id)]);
            return Err(e);
        }

        if let Some(record) = self.transfers.get_mut(setup_id) {
            record.chain_next = data_id.or(Some(status_id));
        }
        if let Some(record) = data_id.and_then(|id| self.transfers.get_mut(id)) {
            record.chain_next = Some(status_id);
        }
        if let Some(record) = self.pipes.get_mut(pipe) {
            record.direction = setup.direction();
        }
        self.async_followup.push_back(&mut self.transfers, status_id, ListKind::Async);

        self.submit(pipe);
        Ok(status_id)
    }

    /// Queue one bulk or interrupt transfer of `len` bytes in the pipe's
    /// direction.
    pub fn queue_data_transfer(&mut self, pipe: PipeId, buffer: BufferHandle, len: usize) -> Result<TransferId> {
        let record = self.pipes.get(pipe).ok_or(UsbError::InvalidParameter)?;
        let list = match record.kind {
            TransferType::Bulk => ListKind::Async,
            TransferType::Interrupt => ListKind::Periodic,
            TransferType::Control => return Err(UsbError::InvalidParameter),
            TransferType::Isochronous => return Err(UsbError::Unsupported),
        };
        let direction = record.direction;
        if len > buffer.capacity() {
            return Err(UsbError::BufferOverflow);
        }

        let id = self.alloc_transfer(Transfer {
            buffer: Some(buffer),
            length: len,
            ..Transfer::new(pipe, Stage::Single)
        })?;
        let armed = self
            .arm_data(id, direction, buffer, len, true)
            .and_then(|()| self.append_chain(pipe, id, id));
        if let Err(e) = armed {
            self.release_transfer(id);
            return Err(e);
        }

        match list {
            ListKind::Async => self.async_followup.push_back(&mut self.transfers, id, list),
            ListKind::Periodic => self.periodic_followup.push_back(&mut self.transfers, id, list),
        }

        self.submit(pipe);
        Ok(id)
    }

    /// Transfer record
    pub fn transfer(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(id)
    }

    /// Hardware descriptor of a live transfer record
    pub fn qtd(&self, id: TransferId) -> Option<&QueueTD> {
        if !self.transfers.contains(id) {
            return None;
        }
        self.arena.qtd(id.index())
    }

    /// Transfers waiting on one followup list, oldest first
    pub fn followup(&self, kind: ListKind) -> impl Iterator<Item = TransferId> + '_ {
        let list = match kind {
            ListKind::Async => &self.async_followup,
            ListKind::Periodic => &self.periodic_followup,
        };
        core::iter::successors(list.first(), move |id| {
            self.transfers.get(*id).and_then(|t| t.followup_next)
        })
    }

    /// Map a qTD bus address reported by the controller to its record
    pub fn transfer_for_descriptor(&self, bus_address: u32) -> Option<TransferId> {
        let bus_address = bus_address & !0x1F;
        self.transfers
            .iter()
            .map(|(id, _)| id)
            .find(|id| self.qtd_bus_address(*id) == Some(bus_address))
    }

    /// Retire `id` if the controller is done with it.
    ///
    /// Returns `None` while the descriptor is still active, or when `id` is
    /// not a followup record. Otherwise every record of the transfer is
    /// released and the completion is returned with its route.
    pub(crate) fn retire_transfer(&mut self, id: TransferId) -> Option<(Route, Completion)> {
        let transfer = self.transfers.get(id)?;
        if transfer.list.is_none() {
            return None;
        }

        let stages = [transfer.stages[0], transfer.stages[1], Some(id)];
        let data_stage = match transfer.stage {
            Stage::Status => transfer.stages[1],
            _ => Some(id),
        };

        let mut finished = !self.arena.qtd(id.index())?.is_active();
        let mut status = Ok(());
        for stage in stages.iter().flatten() {
            let Some(qtd) = self.arena.qtd(stage.index()) else {
                continue;
            };
            if !qtd.is_active() {
                if let Err(e) = qtd.status() {
                    status = Err(e);
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            return None;
        }

        let actual = data_stage
            .and_then(|stage| self.arena.qtd(stage.index()))
            .map(|qtd| transfer.length.saturating_sub(qtd.remaining()))
            .unwrap_or(0);

        let pipe = transfer.pipe;
        let record = self.pipes.get(pipe)?;
        let route = match (transfer.driver, record.owner) {
            (Some(driver), _) => Route::Control(driver),
            (None, PipeOwner::Driver(driver)) => Route::Pipe(driver),
            (None, PipeOwner::Enumeration) => Route::Enumeration,
        };
        let completion = Completion {
            transfer: id,
            pipe,
            device: record.device,
            setup: transfer.setup,
            buffer: transfer.buffer,
            requested: transfer.length,
            actual,
            status,
        };

        let reads = match transfer.setup {
            Some(setup) => setup.direction() == Direction::In,
            None => record.direction == Direction::In,
        };
        if let (true, Some(buffer)) = (reads, completion.buffer) {
            crate::dma::prepare_for_cpu(&self.buffers.get(buffer)[..actual]);
        }

        for stage in stages.into_iter().flatten() {
            self.unchain(pipe, stage);
            self.release_transfer(stage);
        }
        self.restart_pipe(pipe);

        #[cfg(feature = "defmt")]
        if let Err(e) = completion.status {
            defmt::debug!("Transfer {} on pipe {} failed: {}", id, pipe, e);
        }

        Some((route, completion))
    }

    /// Take a record off its followup list, idle its qTD and free it
    pub(crate) fn release_transfer(&mut self, id: TransferId) {
        let Some(transfer) = self.transfers.get(id) else {
            return;
        };
        let list = transfer.list;
        match list {
            Some(ListKind::Async) => {
                self.async_followup.remove(&mut self.transfers, id);
            }
            Some(ListKind::Periodic) => {
                self.periodic_followup.remove(&mut self.transfers, id);
            }
            None => {}
        }
        if let Some(qtd) = self.arena.qtd(id.index()) {
            qtd.reset();
        }
        self.transfers.free(id);
    }

    fn alloc_transfer(&mut self, transfer: Transfer) -> Result<TransferId> {
        match self.transfers.allocate(transfer) {
            Some(id) => Ok(id),
            None => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Transfer pool exhausted");
                Err(UsbError::NoResources)
            }
        }
    }

    fn discard(&mut self, ids: [Option<TransferId>; 3]) {
        for id in ids.into_iter().flatten() {
            self.release_transfer(id);
        }
    }

    fn qtd_bus_address(&self, id: TransferId) -> Option<u32> {
        let qtd = self.arena.qtd(id.index())?;
        Some(self.controller.dma_address(qtd as *const QueueTD as *const u8))
    }

    fn arm_control(
        &mut self,
        setup_id: TransferId,
        data_id: Option<TransferId>,
        status_id: TransferId,
        setup: &SetupPacket,
        buffer: Option<BufferHandle>,
    ) -> Result<()> {
        let slot = self.arena.setup_mut(setup_id.index()).ok_or(UsbError::InvalidState)?;
        slot.0 = setup.to_bytes();
        crate::dma::prepare_for_device(&slot.0);
        let setup_address = self.controller.dma_address(slot.0.as_ptr());

        let qtd = self.arena.qtd(setup_id.index()).ok_or(UsbError::InvalidState)?;
        qtd.prepare(Pid::Setup, false, setup_address, 8, false)?;
        let mut last = setup_id;

        let direction = setup.direction();
        if let (Some(data_id), Some(buffer)) = (data_id, buffer) {
            self.arm_data(data_id, direction, buffer, setup.length as usize, false)?;
            self.link_stage(last, data_id)?;
            last = data_id;
        }

        let status_pid = match (data_id, direction) {
            (Some(_), Direction::In) => Pid::Out,
            _ => Pid::In,
        };
        let qtd = self.arena.qtd(status_id.index()).ok_or(UsbError::InvalidState)?;
        qtd.prepare(status_pid, true, 0, 0, true)?;
        self.link_stage(last, status_id)
    }

    fn arm_data(
        &mut self,
        id: TransferId,
        direction: Direction,
        buffer: BufferHandle,
        len: usize,
        interrupt_on_complete: bool,
    ) -> Result<()> {
        let data = self.buffers.get(buffer);
        if direction == Direction::Out {
            crate::dma::prepare_for_device(&data[..len]);
        }
        let address = self.controller.dma_address(data.as_ptr());
        let qtd = self.arena.qtd(id.index()).ok_or(UsbError::InvalidState)?;
        // control DATA stages always start at DATA1; bulk/interrupt toggles
        // are tracked by the queue head
        let toggle = self.transfers.get(id).map(|t| t.stage == Stage::Data).unwrap_or(false);
        qtd.prepare(direction.pid(), toggle, address, len, interrupt_on_complete)
    }

    fn link_stage(&self, from: TransferId, to: TransferId) -> Result<()> {
        let address = self.qtd_bus_address(to).ok_or(UsbError::InvalidState)?;
        self.arena.qtd(from.index()).ok_or(UsbError::InvalidState)?.link_next(address);
        Ok(())
    }

    fn append_chain(&mut self, pipe: PipeId, first: TransferId, last: TransferId) -> Result<()> {
        let first_address = self.qtd_bus_address(first).ok_or(UsbError::InvalidState)?;
        let record = self.pipes.get_mut(pipe).ok_or(UsbError::InvalidState)?;
        match record.chain_tail {
            Some(tail) => {
                self.arena.qtd(tail.index()).ok_or(UsbError::InvalidState)?.link_next(first_address);
                if let Some(transfer) = self.transfers.get_mut(tail) {
                    transfer.chain_next = Some(first);
                }
            }
            None => {
                self.arena.qh(pipe.index()).ok_or(UsbError::InvalidState)?.attach_chain(first_address)?;
                record.chain_head = Some(first);
            }
        }
        record.chain_tail = Some(last);
        Ok(())
    }

    fn unchain(&mut self, pipe: PipeId, id: TransferId) {
        let next = self.transfers.get(id).and_then(|t| t.chain_next);
        let Some(record) = self.pipes.get_mut(pipe) else {
            return;
        };
        if record.chain_head == Some(id) {
            record.chain_head = next;
            if next.is_none() {
                record.chain_tail = None;
            }
            return;
        }
        let mut cursor = record.chain_head;
        while let Some(current) = cursor {
            let Some(transfer) = self.transfers.get_mut(current) else {
                return;
            };
            if transfer.chain_next == Some(id) {
                transfer.chain_next = next;
                if record.chain_tail == Some(id) {
                    record.chain_tail = Some(current);
                }
                return;
            }
            cursor = transfer.chain_next;
        }
    }

    /// Get a halted or stranded queue head moving on the rest of its chain
    fn restart_pipe(&mut self, pipe: PipeId) {
        let Some(record) = self.pipes.get(pipe) else {
            return;
        };
        let Some(qh) = self.arena.qh(pipe.index()) else {
            return;
        };
        let head = record.chain_head;
        match head {
            Some(head) => {
                let head_active = self.arena.qtd(head.index()).map(QueueTD::is_active).unwrap_or(false);
                if head_active && (qh.is_halted() || qh.is_idle()) {
                    if let Some(address) = self.qtd_bus_address(head) {
                        if qh.attach_chain(address).is_ok() {
                            self.submit(pipe);
                        }
                    }
                }
            }
            None if qh.is_halted() => qh.reset_overlay(),
            None => {}
        }
    }

    fn submit(&mut self, pipe: PipeId) {
        crate::dma::barrier();
        if let Some(qh) = self.arena.qh(pipe.index()) {
            self.controller.submit(pipe, qh);
        }
    }
}
