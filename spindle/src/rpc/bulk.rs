use crate::engine::{BulkAccess, BulkBuffer, BulkOp, RemoteRegion};
use crate::error::{Error, Result};
use crate::instance::Handle;
use crate::monitor::EventArgs;
use crate::registry::OpKind;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Memory exposed to peers for one-sided transfers. The region stays
/// registered with the engine until dropped.
pub struct BulkRegion {
    handle: Handle,
    descriptor: RemoteRegion,
    buffer: BulkBuffer,
}

impl fmt::Debug for BulkRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkRegion")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl BulkRegion {
    /// What a peer needs to address this region. Usually sent as part of an
    /// rpc input.
    pub fn descriptor(&self) -> &RemoteRegion {
        &self.descriptor
    }

    pub fn len(&self) -> usize {
        self.descriptor.len
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.len == 0
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }
}

impl Drop for BulkRegion {
    fn drop(&mut self) {
        let mut span = self.handle.shared.monitor.begin(EventArgs::BulkFree {
            region: self.descriptor.id,
        });
        let res = self
            .handle
            .shared
            .engine
            .deregister_region(&self.descriptor)
            .map_err(Error::from);
        if let Err(e) = &res {
            tracing::debug!(region = self.descriptor.id, error = %e, "failed to deregister bulk region");
        }
        span.set_outcome(&res);
    }
}

impl Handle {
    /// Registers `data` with the engine so peers can pull from or push to it,
    /// as `access` allows.
    pub fn bulk_create(&self, data: Vec<u8>, access: BulkAccess) -> Result<BulkRegion> {
        let mut span = self.shared.monitor.begin(EventArgs::BulkCreate {
            size: data.len(),
            access,
            region: None,
        });

        let buffer: BulkBuffer = Arc::new(Mutex::new(data));
        let res = self
            .check_submit()
            .and_then(|()| {
                self.shared
                    .engine
                    .register_region(Arc::clone(&buffer), access)
                    .map_err(Error::from)
            })
            .map(|descriptor| BulkRegion {
                handle: self.clone(),
                descriptor,
                buffer,
            });

        if let (Ok(region), EventArgs::BulkCreate { region: id, .. }) = (&res, span.args_mut()) {
            *id = Some(region.descriptor.id);
        }
        span.set_outcome(&res);
        res
    }

    /// Moves `size` bytes between a peer's region and a local one and
    /// suspends until the engine is done. [`BulkOp::Pull`] copies remote to
    /// local, [`BulkOp::Push`] local to remote.
    ///
    /// Allowed while the instance drains so handlers already running can
    /// finish their transfers.
    pub async fn bulk_transfer(
        &self,
        op: BulkOp,
        remote: &RemoteRegion,
        remote_offset: usize,
        local: &BulkRegion,
        local_offset: usize,
        size: usize,
    ) -> Result<()> {
        let mut span = self.shared.monitor.begin(EventArgs::BulkTransfer {
            op,
            origin: remote.owner.clone(),
            remote_region: remote.id,
            remote_offset,
            local_region: local.descriptor.id,
            local_offset,
            size,
            request: None,
        });

        let res: Result<()> = async {
            self.check_respond()?;

            let key = self.shared.registry.register(OpKind::Bulk)?;
            let operation = self.operation(key);
            if let EventArgs::BulkTransfer { request, .. } = span.args_mut() {
                *request = Some(key);
            }

            let engine_op = self.shared.engine.submit_transfer(
                op,
                &local.descriptor,
                local_offset,
                remote,
                remote_offset,
                size,
                key.as_u64(),
            )?;
            self.shared.registry.attach_engine_op(key, engine_op);
            self.signal_pending();

            self.wait(operation).await.map(|_| ())
        }
        .await;

        span.set_outcome(&res);
        res
    }
}
