pub mod catalog;
pub mod decode;
pub mod planner;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use std::{collections::BTreeMap, io, net::SocketAddr};
use thiserror::Error;
use tokio_modbus::{
    client::{tcp, Client, Context, Reader},
    slave::Slave,
    Address, Exception, Quantity,
};

use self::catalog::RegisterCatalog;
use self::decode::{decode, DecodeError, Word};

/// Decoded-and-scaled readings of one poll cycle, keyed by definition
/// name. A missing key means that definition produced no fresh value this
/// cycle, never that it read zero.
pub type Snapshot = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Label(String),
}

/// The only engine failure visible to the scheduling caller: the session
/// could not be established, the cycle produced nothing.
#[derive(Debug, Error)]
#[error("failed to connect to {addr}: {source}")]
pub struct ConnectError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// Per-block and per-definition problems absorbed during a cycle. Each one
/// costs the affected snapshot keys and nothing else.
#[derive(Debug, Error)]
pub enum PollFailure {
    #[error("read of {words} words at {start} failed: {source}")]
    BlockTransport {
        start: Address,
        words: Quantity,
        #[source]
        source: io::Error,
    },

    #[error("device rejected read of {words} words at {start}: {exception}")]
    BlockProtocol {
        start: Address,
        words: Quantity,
        exception: Exception,
    },

    #[error("could not decode `{name}`: {source}")]
    Decode {
        name: String,
        #[source]
        source: DecodeError,
    },
}

#[derive(Debug, Default)]
pub struct PollOutcome {
    pub snapshot: Snapshot,
    pub failures: Vec<PollFailure>,
}

impl PollOutcome {
    /// A transport-level failure means the session cannot be trusted for
    /// further cycles.
    pub fn connection_lost(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| matches!(failure, PollFailure::BlockTransport { .. }))
    }
}

/// Batched register access, the seam between the poll fold and the Modbus
/// session. The outer error is transport-level (session unusable), the
/// inner `Exception` is the device validly refusing one read.
#[async_trait]
pub trait RegisterReader {
    async fn read_registers(
        &mut self,
        addr: Address,
        cnt: Quantity,
    ) -> io::Result<Result<Vec<Word>, Exception>>;
}

#[async_trait]
impl RegisterReader for Context {
    async fn read_registers(
        &mut self,
        addr: Address,
        cnt: Quantity,
    ) -> io::Result<Result<Vec<Word>, Exception>> {
        self.read_holding_registers(addr, cnt)
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

/// Read all planned blocks once and fold the decoded values into a
/// snapshot. Block and definition problems are recorded, never raised;
/// after a transport error the remaining blocks are still attempted (they
/// degrade to transport errors themselves, the session is not reconnected
/// mid-cycle).
pub async fn poll_catalog<R>(reader: &mut R, catalog: &RegisterCatalog, max_gap: u16) -> PollOutcome
where
    R: RegisterReader + ?Sized,
{
    let mut outcome = PollOutcome::default();

    for block in planner::plan(catalog, max_gap) {
        let start = block.start();
        let words = block.word_count();

        let read = match reader.read_registers(start, words).await {
            Err(source) => {
                outcome.failures.push(PollFailure::BlockTransport { start, words, source });
                continue;
            }
            Ok(Err(exception)) => {
                outcome.failures.push(PollFailure::BlockProtocol { start, words, exception });
                continue;
            }
            Ok(Ok(read)) => read,
        };

        for def in block.defs() {
            let offset = usize::from(def.address - start);
            let count = usize::from(def.ty.word_count());
            let window = read.get(offset..offset + count).unwrap_or(&[]);

            match decode(window, def.ty) {
                Ok(raw) => {
                    outcome.snapshot.insert(def.name.clone(), def.apply(raw));
                }
                Err(source) => {
                    outcome
                        .failures
                        .push(PollFailure::Decode { name: def.name.clone(), source });
                }
            }
        }
    }

    outcome
}

/// One Modbus TCP session to a KSEM, exclusively owned by its poll loop.
pub struct KsemModbusClient {
    addr: SocketAddr,
    slave: Slave,
    ctx: Option<Context>,
}

impl KsemModbusClient {
    pub fn new(addr: SocketAddr, unit_id: u8) -> Self {
        Self { addr, slave: Slave(unit_id), ctx: None }
    }

    /// Establish the session unless one is already live.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.ctx.is_none() {
            let ctx = tcp::connect_slave(self.addr, self.slave)
                .await
                .map_err(|source| ConnectError { addr: self.addr, source })?;
            debug!("modbus session to {} established", self.addr);
            self.ctx = Some(ctx);
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }

    /// Run one poll cycle. Connecting is the only failure that escapes;
    /// everything else is folded into the outcome. A session that suffered
    /// a transport error is dropped so the next cycle reconnects.
    pub async fn poll_once(
        &mut self,
        catalog: &RegisterCatalog,
        max_gap: u16,
    ) -> Result<PollOutcome, ConnectError> {
        let mut ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => {
                let ctx = tcp::connect_slave(self.addr, self.slave)
                    .await
                    .map_err(|source| ConnectError { addr: self.addr, source })?;
                debug!("modbus session to {} established", self.addr);
                ctx
            }
        };

        let outcome = poll_catalog(&mut ctx, catalog, max_gap).await;

        if outcome.connection_lost() {
            warn!("modbus session to {} lost, reconnecting next cycle", self.addr);
            let _ = ctx.disconnect().await;
        } else {
            self.ctx = Some(ctx);
        }

        Ok(outcome)
    }
}
