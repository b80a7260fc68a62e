//! 资源池：工作流准入控制
//!
//! 需求按容量归一化后与 `1.0 - 当前占用` 比较；检查与提交在同一把锁内完成，
//! 成功时返回 [`Reservation`]，drop 时归还占用。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::workflow::ResourceDemand;

/// 浮点累加误差容忍
const EPSILON: f64 = 1e-9;

/// 各轴占用比例（0.0 - 1.0）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Utilization {
    pub cpu: f64,
    pub gpu: f64,
}

/// 准入失败
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "insufficient resources: requested cpu {requested_cpu:.3} gpu {requested_gpu:.3}, \
     available cpu {available_cpu:.3} gpu {available_gpu:.3}"
)]
pub struct InsufficientResources {
    pub requested_cpu: f64,
    pub requested_gpu: f64,
    pub available_cpu: f64,
    pub available_gpu: f64,
}

#[derive(Debug)]
struct PoolInner {
    cpu_capacity: f64,
    gpu_capacity: f64,
    usage: Mutex<Utilization>,
}

impl PoolInner {
    fn usage(&self) -> MutexGuard<'_, Utilization> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 共享资源池（clone 后指向同一份占用）
#[derive(Debug, Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    pub fn new(cpu_capacity: f64, gpu_capacity: f64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                cpu_capacity,
                gpu_capacity,
                usage: Mutex::new(Utilization::default()),
            }),
        }
    }

    /// 当前占用比例
    pub fn utilization(&self) -> Utilization {
        *self.inner.usage()
    }

    /// 需求换算为占用比例
    pub fn share_of(&self, demand: &ResourceDemand) -> Utilization {
        Utilization {
            cpu: normalise(demand.cpu, self.inner.cpu_capacity),
            gpu: normalise(demand.gpu, self.inner.gpu_capacity),
        }
    }

    /// 原子地检查并占用资源
    pub fn try_reserve(&self, demand: ResourceDemand) -> Result<Reservation, InsufficientResources> {
        let share = self.share_of(&demand);
        let mut usage = self.inner.usage();

        let available_cpu = 1.0 - usage.cpu;
        let available_gpu = 1.0 - usage.gpu;
        if share.cpu > available_cpu + EPSILON || share.gpu > available_gpu + EPSILON {
            return Err(InsufficientResources {
                requested_cpu: share.cpu,
                requested_gpu: share.gpu,
                available_cpu,
                available_gpu,
            });
        }

        usage.cpu += share.cpu;
        usage.gpu += share.gpu;
        tracing::debug!(cpu = usage.cpu, gpu = usage.gpu, "Resources reserved");

        Ok(Reservation {
            pool: Arc::clone(&self.inner),
            share,
        })
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(8.0, 4.0)
    }
}

fn normalise(amount: f64, capacity: f64) -> f64 {
    if amount <= 0.0 {
        0.0
    } else if capacity <= 0.0 {
        f64::INFINITY
    } else {
        amount / capacity
    }
}

/// 已占用的资源；drop 时归还
#[derive(Debug)]
pub struct Reservation {
    pool: Arc<PoolInner>,
    share: Utilization,
}

impl Reservation {
    pub fn share(&self) -> Utilization {
        self.share
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut usage = self.pool.usage();
        usage.cpu = (usage.cpu - self.share.cpu).max(0.0);
        usage.gpu = (usage.gpu - self.share.gpu).max(0.0);
        tracing::debug!(cpu = usage.cpu, gpu = usage.gpu, "Resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let pool = ResourcePool::new(8.0, 4.0);
        let reservation = pool
            .try_reserve(ResourceDemand::new(5.0, 2.0, 18.0))
            .unwrap();
        assert_eq!(pool.utilization(), Utilization { cpu: 0.625, gpu: 0.5 });
        assert_eq!(reservation.share().cpu, 0.625);

        drop(reservation);
        assert_eq!(pool.utilization(), Utilization::default());
    }

    #[test]
    fn test_rejects_when_demand_exceeds_remaining() {
        let pool = ResourcePool::new(1.0, 1.0);
        let _held = pool.try_reserve(ResourceDemand::new(0.7, 0.6, 0.0)).unwrap();

        let err = pool
            .try_reserve(ResourceDemand::new(0.9, 0.6, 0.0))
            .unwrap_err();
        assert!((err.available_cpu - 0.3).abs() < 1e-9);
        assert!(err.to_string().starts_with("insufficient resources"));
        // 拒绝不改变占用
        assert!((pool.utilization().cpu - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_exact_fit_is_admitted() {
        let pool = ResourcePool::new(8.0, 4.0);
        let _a = pool.try_reserve(ResourceDemand::new(5.0, 2.0, 0.0)).unwrap();
        let _b = pool.try_reserve(ResourceDemand::new(3.0, 2.0, 0.0)).unwrap();
        assert!(pool.try_reserve(ResourceDemand::new(0.1, 0.0, 0.0)).is_err());
        // 不占用任何资源的需求总能通过
        assert!(pool.try_reserve(ResourceDemand::default()).is_ok());
    }

    #[test]
    fn test_zero_capacity_axis_rejects_positive_demand() {
        let pool = ResourcePool::new(4.0, 0.0);
        assert!(pool.try_reserve(ResourceDemand::new(1.0, 0.0, 0.0)).is_ok());
        assert!(pool.try_reserve(ResourceDemand::new(1.0, 0.5, 0.0)).is_err());
    }

    #[test]
    fn test_concurrent_admission_admits_exactly_one() {
        let pool = ResourcePool::new(1.0, 1.0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.try_reserve(ResourceDemand::new(0.6, 0.1, 0.0)))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!((pool.utilization().cpu - 0.6).abs() < 1e-9);
    }
}
