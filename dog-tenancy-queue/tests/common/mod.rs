#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dog_tenancy::{
    Connector, DataHandle, HandleError, InMemoryDirectory, Tenancy, TenancyConfig,
    TenantContextScope, TenantDescriptor,
};
use dog_tenancy_queue::{ConsumeInterceptor, Envelope, HandlerError, MessageHandler};
use parking_lot::Mutex;

/// Connection recording the store it was opened against.
#[derive(Debug)]
pub struct StoreConnection {
    pub target: String,
}

#[derive(Default)]
pub struct StoreConnector;

#[async_trait]
impl Connector for StoreConnector {
    type Connection = StoreConnection;

    async fn connect(&self, tenant: &TenantDescriptor) -> Result<StoreConnection, HandleError> {
        tokio::task::yield_now().await;
        Ok(StoreConnection {
            target: tenant.connection_target.as_str().to_string(),
        })
    }
}

pub fn directory() -> InMemoryDirectory {
    InMemoryDirectory::with_tenants([
        TenantDescriptor::new("t-acme", "Acme", "acme", "db-acme"),
        TenantDescriptor::new("t-a", "A", "a", "db-a"),
        TenantDescriptor::new("t-b", "B", "b", "db-b"),
        TenantDescriptor::new("t-c", "C", "c", "db-c"),
        TenantDescriptor::new("t-beta", "Beta", "beta", "db-beta").inactive(),
    ])
    .unwrap()
}

pub fn interceptor(directory: &InMemoryDirectory) -> ConsumeInterceptor<StoreConnector> {
    ConsumeInterceptor::new(Tenancy::new(
        Arc::new(directory.clone()),
        StoreConnector,
        TenancyConfig::default(),
    ))
}

/// What the handler should do once invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(HandlerError),
    Panic,
    Hang,
    Sleep(Duration),
}

/// Message payload: the store the publisher expects the handler to see.
pub type Message = Envelope<String>;

pub fn message(tenant: &str) -> Message {
    Envelope::new(tenant, format!("db-{tenant}"))
}

/// Handler recording every invocation and checking tenant isolation.
pub struct RecordingHandler {
    pub behavior: Behavior,
    pub calls: AtomicUsize,
    pub mismatches: AtomicUsize,
    pub scopes: Mutex<Vec<TenantContextScope>>,
}

impl RecordingHandler {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            mismatches: AtomicUsize::new(0),
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn mismatches(&self) -> usize {
        self.mismatches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler<Message, StoreConnection> for RecordingHandler {
    async fn handle(
        &self,
        scope: &TenantContextScope,
        handle: &mut DataHandle<StoreConnection>,
        envelope: &Message,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scopes.lock().push(scope.clone());

        // suspend so concurrently running units interleave
        tokio::task::yield_now().await;

        let expected = envelope.payload.as_str();
        let via_scope = scope.connection_target()?.as_str().to_string();
        let via_handle = handle.connection()?.target.clone();
        let via_ambient = TenantContextScope::with_current(|current| {
            current
                .connection_target()
                .map(|target| target.as_str().to_string())
        })??;
        if via_scope != expected || via_handle != expected || via_ambient != expected {
            self.mismatches.fetch_add(1, Ordering::SeqCst);
        }

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(err) => Err(err.clone()),
            Behavior::Panic => panic!("handler exploded"),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
        }
    }
}
