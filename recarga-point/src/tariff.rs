//! Charge cost model

use rand::Rng;

/// Simulated session parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    pub power_kw: f64,
    /// Price per kWh in R$
    pub tariff_per_kwh: f64,
    pub min_hours: f64,
    pub max_hours: f64,
}

/// Computed cost of one session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeCost {
    pub hours: f64,
    pub consumed_kwh: f64,
    pub amount: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            power_kw: 22.0,
            tariff_per_kwh: 0.80,
            min_hours: 1.0,
            max_hours: 2.0,
        }
    }
}

impl CostModel {
    /// Cost of a session lasting `hours`
    pub fn cost_for(&self, hours: f64) -> ChargeCost {
        let consumed_kwh = self.power_kw * hours;
        ChargeCost {
            hours,
            consumed_kwh,
            amount: consumed_kwh * self.tariff_per_kwh,
        }
    }

    /// Draw a session length in `[min_hours, max_hours)` and price it
    pub fn sample<R: Rng>(&self, rng: &mut R) -> ChargeCost {
        let hours = if self.max_hours > self.min_hours {
            rng.gen_range(self.min_hours..self.max_hours)
        } else {
            self.min_hours
        };
        self.cost_for(hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_cost_for() {
        let cost = CostModel::default().cost_for(1.5);
        assert!((cost.consumed_kwh - 33.0).abs() < 1e-9);
        assert!((cost.amount - 26.4).abs() < 1e-9);
    }

    #[test]
    fn test_sample_bounds() {
        let model = CostModel::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let cost = model.sample(&mut rng);
            assert!((1.0..2.0).contains(&cost.hours));
            assert!((22.0..44.0).contains(&cost.consumed_kwh));
            assert!((cost.amount - cost.consumed_kwh * 0.80).abs() < 1e-9);
        }
    }

    #[test]
    fn test_sample_is_reproducible() {
        let model = CostModel::default();
        let a = model.sample(&mut StdRng::seed_from_u64(42));
        let b = model.sample(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fixed_duration() {
        let model = CostModel {
            min_hours: 2.0,
            max_hours: 2.0,
            ..Default::default()
        };
        let cost = model.sample(&mut StdRng::seed_from_u64(1));
        assert_eq!(cost.hours, 2.0);
    }
}
