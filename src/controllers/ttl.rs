//! Garbage collection of ended jobs once their `ttl` has passed.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::DeleteParams;
use kube::Resource;
use log::info;

use crate::common::conditions::{self, Conditional, CONDITION_ENDED};
use crate::common::parse_duration;
use crate::crd::{BackupJob, RestoreJob};
use crate::errors::*;
use crate::runtime::{Actor, Context, Object};

/// A kind that is deleted some time after it ends.
pub trait Expiring: Object + Conditional {
    fn ttl(&self) -> Option<&str>;
}

impl Expiring for BackupJob {
    fn ttl(&self) -> Option<&str> {
        self.spec.ttl.as_deref()
    }
}

impl Expiring for RestoreJob {
    fn ttl(&self) -> Option<&str> {
        self.spec.ttl.as_deref()
    }
}

/// Time left before `obj` may be deleted; `None` while it has not ended
/// or carries no ttl.
pub fn remaining<K: Expiring>(obj: &K, now: DateTime<Utc>) -> Result<Option<Duration>> {
    let Some(ttl) = obj.ttl().filter(|t| !t.trim().is_empty()) else {
        return Ok(None);
    };
    let ttl = parse_duration(ttl)?;
    let Some(ended) = conditions::find(obj.conditions(), CONDITION_ENDED)
        .filter(|c| c.status == conditions::STATUS_TRUE)
    else {
        return Ok(None);
    };
    let elapsed = (now - ended.last_transition_time.0).to_std().unwrap_or_default();
    Ok(Some(ttl.saturating_sub(elapsed)))
}

pub struct TtlGc<K>(PhantomData<fn() -> K>);

impl<K> TtlGc<K> {
    pub fn new() -> Self {
        TtlGc(PhantomData)
    }
}

impl<K> Default for TtlGc<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: Expiring> Actor<K> for TtlGc<K> {
    async fn observe(&self, ctx: &Context<K>) -> Result<Option<Duration>> {
        if ctx.obj.meta().deletion_timestamp.is_some() {
            return Ok(None);
        }
        match remaining(ctx.obj.as_ref(), Utc::now())? {
            Some(left) if left.is_zero() => {
                info!("{}: ttl expired, deleting", ctx.key());
                match ctx.self_api().delete(&ctx.name(), &DeleteParams::background()).await {
                    Ok(_) => Ok(None),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            left => Ok(left),
        }
    }
}
