//! Matrix expansion for parallel job generation.

use gauntlet_core::interpolation::InterpolationContext;
use gauntlet_core::pipeline::{JobSpec, MatrixConfig};

/// One concrete combination of a job's matrix axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixJob {
    pub job_name: String,
    /// Position in the expansion.
    pub index: usize,
    /// Axis assignment in declaration order.
    pub values: Vec<(String, String)>,
    pub display_name: String,
}

impl MatrixJob {
    /// Interpolation context carrying this combination's `matrix.*` values.
    pub fn context(&self) -> InterpolationContext {
        let mut ctx = InterpolationContext::new();
        ctx.matrix = self.values.iter().cloned().collect();
        ctx
    }
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job into one [`MatrixJob`] per axis combination.
    ///
    /// Combinations come out in odometer order: the last declared axis
    /// varies fastest. A job without a matrix expands to a single job.
    pub fn expand(&self, job_name: &str, job: &JobSpec) -> Vec<MatrixJob> {
        let combinations = match job.matrix() {
            Some(matrix) => self.combinations(matrix),
            None => vec![Vec::new()],
        };

        combinations
            .into_iter()
            .enumerate()
            .map(|(index, values)| MatrixJob {
                job_name: job_name.to_string(),
                index,
                display_name: self.format_display_name(job_name, &values),
                values,
            })
            .collect()
    }

    fn combinations(&self, matrix: &MatrixConfig) -> Vec<Vec<(String, String)>> {
        let mut result = vec![Vec::new()];
        for axis in &matrix.axes {
            let mut next = Vec::with_capacity(result.len() * axis.values.len());
            for combo in &result {
                for value in &axis.values {
                    let mut extended = combo.clone();
                    extended.push((axis.name.clone(), value.clone()));
                    next.push(extended);
                }
            }
            result = next;
        }
        result
    }

    fn format_display_name(&self, job_name: &str, values: &[(String, String)]) -> String {
        if values.is_empty() {
            return job_name.to_string();
        }
        let parts: Vec<String> = values.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{} ({})", job_name, parts.join(", "))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
