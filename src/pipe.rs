//! Pipes: logical channels to one device endpoint
//!
//! A pipe's hardware side is the queue head at its slot index in the
//! descriptor arena; the record here keeps the software view and the chain
//! of transfers attached to that queue head.

use crate::device::DeviceId;
use crate::driver::DriverId;
use crate::ehci::{EndpointConfig, HostController};
use crate::error::{Result, UsbError};
use crate::host::HostCore;
use crate::pool::Handle;
use crate::timer::Timer;
use crate::transfer::{Direction, TransferId, TransferType};

/// Handle to a [`Pipe`] record
pub type PipeId = Handle<Pipe>;

/// Receiver of completions on a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeOwner {
    /// The default control pipe, driven by the enumeration state machine
    Enumeration,
    /// A pipe opened by a driver
    Driver(DriverId),
}

/// One logical channel
#[derive(Debug)]
pub struct Pipe {
    pub(crate) device: DeviceId,
    pub(crate) kind: TransferType,
    pub(crate) direction: Direction,
    pub(crate) endpoint: u8,
    pub(crate) max_packet_len: u16,
    pub(crate) interval: u8,
    pub(crate) owner: PipeOwner,
    pub(crate) chain_head: Option<TransferId>,
    pub(crate) chain_tail: Option<TransferId>,
}

impl Pipe {
    /// Device the pipe talks to
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Transfer type
    pub fn kind(&self) -> TransferType {
        self.kind
    }

    /// Data direction. Fixed except on control pipes, where it follows the
    /// most recently queued request.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Endpoint number
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Maximum packet length
    pub fn max_packet_len(&self) -> u16 {
        self.max_packet_len
    }

    /// Polling interval (interrupt pipes)
    pub fn interval(&self) -> u8 {
        self.interval
    }

    /// Completion receiver
    pub fn owner(&self) -> PipeOwner {
        self.owner
    }

    /// True while transfers are attached
    pub fn is_busy(&self) -> bool {
        self.chain_head.is_some()
    }
}

impl<C: HostController, T: Timer> HostCore<C, T> {
    /// Open a pipe to `endpoint` of `device` and link its queue head into
    /// the matching schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pipe(
        &mut self,
        device: DeviceId,
        kind: TransferType,
        endpoint: u8,
        direction: Direction,
        max_packet_len: u16,
        interval: u8,
        owner: PipeOwner,
    ) -> Result<PipeId> {
        if kind == TransferType::Isochronous {
            return Err(UsbError::Unsupported);
        }
        let dev = self.devices.get(device).ok_or(UsbError::DeviceDisconnected)?;
        let config = EndpointConfig {
            address: dev.address,
            endpoint,
            speed: dev.speed,
            max_packet_len,
            control: kind == TransferType::Control,
            periodic: kind == TransferType::Interrupt,
            hub_address: dev.tt.0,
            hub_port: dev.tt.1,
        };

        let pipe = Pipe {
            device,
            kind,
            direction,
            endpoint,
            max_packet_len,
            interval,
            owner,
            chain_head: None,
            chain_tail: None,
        };
        let Some(id) = self.pipes.allocate(pipe) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("Pipe pool exhausted");
            return Err(UsbError::NoResources);
        };

        let Some(qh) = self.arena.qh(id.index()) else {
            self.pipes.free(id);
            return Err(UsbError::InvalidState);
        };
        if let Err(e) = qh.configure(&config) {
            self.pipes.free(id);
            return Err(e);
        }
        crate::dma::barrier();
        match kind {
            TransferType::Interrupt => self.controller.link_periodic(id, qh, interval),
            _ => self.controller.link_async(id, qh),
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("Pipe {} opened: ep {} {} mps {}", id, endpoint, kind, max_packet_len);

        Ok(id)
    }

    /// Close a pipe: unlink its queue head and drop every transfer still
    /// attached to it. Buffers stay with whoever allocated them.
    pub fn delete_pipe(&mut self, pipe: PipeId) -> Result<()> {
        let kind = self.pipes.get(pipe).ok_or(UsbError::InvalidParameter)?.kind;
        if let Some(qh) = self.arena.qh(pipe.index()) {
            self.controller.unlink(pipe, qh, kind);
        }

        let mut outstanding: heapless::Vec<TransferId, { crate::config::MAX_TRANSFERS }> = heapless::Vec::new();
        for (id, transfer) in self.transfers.iter() {
            if transfer.pipe == pipe {
                // capacities match, cannot overflow
                let _ = outstanding.push(id);
            }
        }
        for id in outstanding {
            self.release_transfer(id);
        }

        if let Some(qh) = self.arena.qh(pipe.index()) {
            qh.clear();
        }
        self.pipes.free(pipe);
        Ok(())
    }

    /// Rewrite the maximum packet length of a pipe
    pub fn pipe_set_maxlen(&mut self, pipe: PipeId, len: u16) -> Result<()> {
        let record = self.pipes.get_mut(pipe).ok_or(UsbError::InvalidParameter)?;
        record.max_packet_len = len;
        if let Some(qh) = self.arena.qh(pipe.index()) {
            qh.set_max_packet_len(len);
        }
        Ok(())
    }

    /// Rewrite the device address of a pipe
    pub fn pipe_set_addr(&mut self, pipe: PipeId, address: u8) -> Result<()> {
        if address > 127 {
            return Err(UsbError::InvalidParameter);
        }
        if !self.pipes.contains(pipe) {
            return Err(UsbError::InvalidParameter);
        }
        if let Some(qh) = self.arena.qh(pipe.index()) {
            qh.set_address(address);
        }
        Ok(())
    }

    /// Pipe record
    pub fn pipe(&self, pipe: PipeId) -> Option<&Pipe> {
        self.pipes.get(pipe)
    }

    /// Pipes opened on `device`
    pub fn pipes_of(&self, device: DeviceId) -> impl Iterator<Item = PipeId> + '_ {
        self.pipes
            .iter()
            .filter(move |(_, pipe)| pipe.device == device)
            .map(|(id, _)| id)
    }
}
