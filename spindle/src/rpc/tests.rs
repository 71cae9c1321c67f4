use super::*;
use crate::engine::Fabric;
use crate::test_utils::{builder_on, init_instance};
use anyhow::Result;
use rstest::rstest;

async fn ignore(mut request: Request) {
    let _ = request.respond(&()).await;
}

#[test]
fn test_register_twice_is_rejected() -> Result<()> {
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-register-twice")?;

    let id = instance.register("echo", ignore)?;
    assert_eq!(id, RpcId::from_name("echo"));
    assert!(instance.is_registered(id));
    assert!(matches!(
        instance.register("echo", ignore),
        Err(Error::AlreadyRegistered(dup)) if dup == id
    ));
    assert_eq!(instance.num_registered(), 1);

    instance.finalize()?;
    Ok(())
}

#[rstest]
#[case::first(1)]
#[case::second(2)]
#[case::last(u16::MAX - 1)]
fn test_providers_share_a_name(#[case] provider_id: u16) -> Result<()> {
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-providers")?;

    let base = instance.register("store.put", ignore)?;
    let muxed = instance.register_provider("store.put", provider_id, None, ignore)?;

    assert_ne!(base, muxed);
    assert_eq!(muxed.base(), base);
    assert_eq!(instance.num_registered(), 2);

    instance.finalize()?;
    Ok(())
}

#[test]
fn test_deregister() -> Result<()> {
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-deregister")?;

    let id = instance.register("gone", ignore)?;
    instance.deregister_rpc(id)?;
    assert!(!instance.is_registered(id));
    assert!(matches!(
        instance.deregister_rpc(id),
        Err(Error::NotRegistered(missing)) if missing == id
    ));

    instance.finalize()?;
    Ok(())
}

#[test]
fn test_deregister_busy_rpc_is_refused() -> Result<()> {
    let table = RpcTable::new();
    let id = RpcId::new(7);
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-busy")?;

    table.insert(RegisteredRpc {
        id,
        name: None,
        handler: boxed(ignore),
        pool: instance.handler_pool().clone(),
        data: Mutex::new(None),
        in_flight: AtomicUsize::new(0),
    })?;

    let first = table.acquire(id).ok_or_else(|| anyhow::anyhow!("rpc missing"))?;
    let second = table.acquire(id).ok_or_else(|| anyhow::anyhow!("rpc missing"))?;

    assert!(matches!(
        table.remove(id),
        Err(Error::RpcBusy { in_flight: 2, .. })
    ));
    assert_eq!(table.in_flight(), 2);

    table.release(&first);
    table.release(&second);
    assert_eq!(table.in_flight(), 0);
    table.remove(id)?;
    assert_eq!(table.len(), 0);

    instance.finalize()?;
    Ok(())
}

#[test]
fn test_acquire_after_deregister_misses() -> Result<()> {
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-acquire-gone")?;
    let rpcs = &instance.shared.rpcs;

    let id = instance.register("short-lived", ignore)?;
    let rpc = rpcs.acquire(id).ok_or_else(|| anyhow::anyhow!("rpc missing"))?;
    assert!(matches!(instance.deregister_rpc(id), Err(Error::RpcBusy { .. })));
    rpcs.release(&rpc);

    instance.deregister_rpc(id)?;
    assert!(rpcs.acquire(id).is_none());
    assert_eq!(rpcs.in_flight(), 0);

    instance.finalize()?;
    Ok(())
}

#[test]
fn test_concurrent_deregister_never_strands_a_handler() -> Result<()> {
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-deregister-race")?;

    for round in 0..200 {
        let id = instance.register(&format!("racy-{round}"), ignore)?;
        let handle = instance.handle();

        let remover = std::thread::spawn(move || handle.deregister_rpc(id).is_ok());
        let acquired = instance.shared.rpcs.acquire(id);
        let removed = remover.join().map_err(|_| anyhow::anyhow!("remover panicked"))?;

        match acquired {
            // Counted before the removal looked: the removal must have failed.
            Some(rpc) => {
                assert!(!removed, "round {round}: rpc removed under a running handler");
                instance.shared.rpcs.release(&rpc);
                instance.deregister_rpc(id)?;
            }
            None => assert!(removed),
        }
    }

    assert_eq!(instance.shared.rpcs.in_flight(), 0);
    instance.finalize()?;
    Ok(())
}

#[test]
fn test_registered_data() -> Result<()> {
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-data")?;

    let id = instance.register("with-data", ignore)?;
    assert!(instance.registered_data::<String>(id).is_none());

    instance.register_data(id, String::from("state"))?;
    let data = instance.registered_data::<String>(id);
    assert_eq!(data.as_deref().map(String::as_str), Some("state"));
    // Wrong type reads as absent.
    assert!(instance.registered_data::<u32>(id).is_none());

    let missing = RpcId::new(1);
    assert!(matches!(
        instance.register_data(missing, 1u32),
        Err(Error::NotRegistered(_))
    ));

    instance.finalize()?;
    Ok(())
}

#[test]
fn test_register_on_foreign_pool_is_rejected() -> Result<()> {
    let fabric = Fabric::new();
    let a = builder_on(&fabric, "rpc-pool-a")?.pool("io", 1).build()?;
    let b = init_instance(&fabric, "rpc-pool-b")?;

    let io = a.pool_by_name("io").cloned();
    let Some(io) = io else {
        anyhow::bail!("pool io missing");
    };

    a.register_on(RpcId::new(1 << 16), &io, ignore)?;
    assert!(matches!(
        b.register_on(RpcId::new(2 << 16), &io, ignore),
        Err(Error::InvalidArg(_))
    ));

    a.finalize()?;
    b.finalize()?;
    Ok(())
}

#[test]
fn test_register_after_finalize_fails() -> Result<()> {
    let fabric = Fabric::new();
    let instance = init_instance(&fabric, "rpc-late")?;
    instance.finalize()?;

    assert!(matches!(
        instance.register("late", ignore),
        Err(Error::Finalized)
    ));
    Ok(())
}
