pub mod analysis;
pub mod covariance;
pub mod kelly;
pub mod optimizer;

pub use covariance::{CorrelationModel, CorrelationSource, CovarianceMatrix, EmpiricalCorrelations};
pub use optimizer::{OptimizerConfig, PortfolioOptimizer, PortfolioSolution, SolverStatus};
