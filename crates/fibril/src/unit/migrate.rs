//! Migration of READY units between pools, schedulers and streams
//!
//! A migration takes both pools' gates exclusively, in pool-id order, so
//! `snapshot_sizes` and `total_size` never observe the unit in both pools or
//! in neither.

use super::{Unit, UnitState};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::sched::Sched;
use crate::xstream::Xstream;
use tracing::trace;

impl Unit {
    /// Move the unit from its pool into `target`
    ///
    /// The unit must be READY, waiting in its home pool, and migratable.
    pub fn migrate_to_pool(&self, target: &Pool) -> Result<()> {
        self.check()?;
        target.validate()?;
        if !self.is_migratable() {
            return Err(Error::MigrationNotAllowed("unit is not migratable"));
        }
        if self.state() != UnitState::Ready {
            return Err(Error::MigrationNotAllowed("unit is not READY"));
        }
        let Some(source) = self.home_pool() else {
            return Err(Error::MigrationNotAllowed("unit has no pool"));
        };
        if &source == target {
            return Err(Error::MigrationTarget);
        }
        source.validate()?;

        let (first, second) = if source.id() < target.id() {
            (&source, target)
        } else {
            (target, &source)
        };
        let _g1 = first.gate_write();
        let _g2 = second.gate_write();

        if self.state() != UnitState::Ready {
            return Err(Error::MigrationNotAllowed("unit is not READY"));
        }
        source.remove_locked(self).map_err(|e| match e {
            Error::FeatureUnavailable(what) => Error::FeatureUnavailable(what),
            _ => Error::MigrationNotAllowed("unit is about to run"),
        })?;
        self.set_home(Some(target.clone()));
        target.push_locked(self.clone());

        trace!(
            unit = self.id().as_u64(),
            from = source.id().as_u64(),
            to = target.id().as_u64(),
            "unit migrated"
        );
        Ok(())
    }

    /// Move the unit into the pool `sched` picks for incoming units
    pub fn migrate_to_sched(&self, sched: &Sched) -> Result<()> {
        let pool = sched.migration_pool()?;
        self.migrate_to_pool(&pool)
    }

    /// Move the unit to the main scheduler of `xstream`
    pub fn migrate_to_xstream(&self, xstream: &Xstream) -> Result<()> {
        let sched = xstream.main_sched().ok_or(Error::InvalidXstream)?;
        self.migrate_to_sched(&sched)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::pool::{snapshot_sizes, Access, Pool, PoolKind};
    use crate::unit::Builder;

    #[test]
    fn test_migrate_between_pools() {
        crate::init().unwrap();
        let a = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
        let b = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
        let unit = Builder::new().spawn(&a, || {}).unwrap();

        assert!(matches!(unit.migrate_to_pool(&a), Err(Error::MigrationTarget)));
        unit.migrate_to_pool(&b).unwrap();
        assert_eq!(snapshot_sizes(&[&a, &b]).unwrap(), vec![0, 1]);
        assert_eq!(unit.home_pool(), Some(b.clone()));

        while b.pop().unwrap().is_some() {}
        crate::finalize().unwrap();
    }

    #[test]
    fn test_migrate_requires_migratable_ready_unit() {
        crate::init().unwrap();
        let a = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
        let b = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();

        let pinned = Builder::new().migratable(false).spawn(&a, || {}).unwrap();
        assert!(matches!(
            pinned.migrate_to_pool(&b),
            Err(Error::MigrationNotAllowed(_))
        ));

        // Popped but not yet run
        let popped = a.pop().unwrap().unwrap();
        assert_eq!(popped, pinned);
        let loose = Builder::new().spawn(&a, || {}).unwrap();
        let taken = a.pop().unwrap().unwrap();
        assert_eq!(taken, loose);
        assert!(matches!(
            loose.migrate_to_pool(&b),
            Err(Error::MigrationNotAllowed(_))
        ));
        crate::finalize().unwrap();
    }

    #[test]
    fn test_steal_pool_cannot_migrate_out() {
        crate::init().unwrap();
        let steal = Pool::new(PoolKind::Steal, Access::Mpmc).unwrap();
        let fifo = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
        let unit = Builder::new().spawn(&steal, || {}).unwrap();
        assert!(matches!(
            unit.migrate_to_pool(&fifo),
            Err(Error::FeatureUnavailable(_))
        ));
        assert_eq!(steal.size().unwrap(), 1);
        while steal.pop().unwrap().is_some() {}
        crate::finalize().unwrap();
    }
}
