//! Synthetic workload generation: job streams drawn from the heatmap's job
//! kinds, and the distributions that spread their submission times.

use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Deserialize;
use serde_json::Value;

use crate::database::Heatmap;
use crate::error::SimError;
use crate::jobs::Job;

/// Arguments of the `random` generator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RandomArgs {
    count: usize,
    /// Remaining-time bounds, sampled log-uniformly.
    #[serde(default = "default_time_range")]
    time: [f64; 2],
    /// Process-count bounds; samples are powers of two within them.
    #[serde(default = "default_procs_range")]
    procs: [u32; 2],
    /// Declared wall time as a multiple of the drawn remaining time.
    #[serde(default = "default_wall_factor")]
    wall_factor: f64,
}

fn default_time_range() -> [f64; 2] {
    [50.0, 500.0]
}

fn default_procs_range() -> [u32; 2] {
    [1, 32]
}

fn default_wall_factor() -> f64 {
    2.0
}

/// One explicit job of the `keys-list` generator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct JobSpec {
    name: String,
    procs: u32,
    time: f64,
    #[serde(default)]
    wall: Option<f64>,
}

/// One job kind of the `keys-dict` generator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct KindSpec {
    count: usize,
    procs: u32,
    time: f64,
    #[serde(default)]
    wall: Option<f64>,
}

/// Materialize a job stream from a generator configuration. `max_procs`
/// bounds random draws to what the cluster can hold.
pub fn generate_jobs(
    gen_type: &str,
    arg: &Value,
    heatmap: &Heatmap,
    max_procs: u32,
    rng: &mut Xoshiro256PlusPlus,
) -> Result<Vec<Job>, SimError> {
    match gen_type {
        "random" => {
            let args: RandomArgs = parse_arg(arg)?;
            random_jobs(&args, heatmap, max_procs, rng)
        }
        "keys-list" => {
            let specs: Vec<JobSpec> = parse_arg(arg)?;
            Ok(specs
                .into_iter()
                .enumerate()
                .map(|(i, s)| spec_job(i as i64, &s.name, s.procs, s.time, s.wall))
                .collect())
        }
        "keys-dict" => {
            // BTreeMap keeps kind order deterministic
            let kinds: std::collections::BTreeMap<String, KindSpec> = parse_arg(arg)?;
            let mut jobs = Vec::new();
            for (name, spec) in kinds {
                for _ in 0..spec.count {
                    jobs.push(spec_job(
                        jobs.len() as i64,
                        &name,
                        spec.procs,
                        spec.time,
                        spec.wall,
                    ));
                }
            }
            Ok(jobs)
        }
        other => Err(SimError::Config(format!("unknown generator {other:?}"))),
    }
}

fn parse_arg<'de, T: Deserialize<'de>>(arg: &'de Value) -> Result<T, SimError> {
    T::deserialize(arg).map_err(|e| SimError::Config(format!("bad generator argument: {e}")))
}

fn spec_job(job_id: i64, name: &str, procs: u32, time: f64, wall: Option<f64>) -> Job {
    Job::new(
        job_id,
        name,
        procs,
        time,
        0.0,
        wall.unwrap_or(time * default_wall_factor()),
    )
}

fn random_jobs(
    args: &RandomArgs,
    heatmap: &Heatmap,
    max_procs: u32,
    rng: &mut Xoshiro256PlusPlus,
) -> Result<Vec<Job>, SimError> {
    let kinds: Vec<&str> = heatmap.kinds().collect();
    if kinds.is_empty() {
        return Err(SimError::Config(
            "the random generator needs a non-empty heatmap".into(),
        ));
    }
    let [time_lo, time_hi] = args.time;
    if !(time_lo > 0.0 && time_hi >= time_lo) {
        return Err(SimError::Config(format!(
            "bad time range [{time_lo}, {time_hi}]"
        )));
    }

    let procs_hi = args.procs[1].min(max_procs).max(1);
    let procs_lo = args.procs[0].clamp(1, procs_hi);

    let mut jobs = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let name = kinds[rng.gen_range(0..kinds.len())];

        // powers of two pack evenly into sockets
        let procs = {
            let raw = rng.gen_range(procs_lo..=procs_hi);
            let mut p = 1u32;
            while p * 2 <= raw {
                p *= 2;
            }
            p.clamp(procs_lo, procs_hi)
        };

        let time = time_lo * (time_hi / time_lo).powf(rng.gen::<f64>());
        jobs.push(spec_job(
            i as i64,
            name,
            procs,
            time,
            Some(time * args.wall_factor),
        ));
    }
    Ok(jobs)
}

/// Spread submission times over the stream. `constant` submits every
/// `step`, `random` draws uniform inter-arrivals with mean `step`, and
/// `poisson` draws exponential inter-arrivals with mean `step`.
pub fn apply_distribution(
    jobs: &mut [Job],
    distr_type: &str,
    step: f64,
    rng: &mut Xoshiro256PlusPlus,
) -> Result<(), SimError> {
    if step < 0.0 {
        return Err(SimError::Config(format!("bad distribution step {step}")));
    }

    let mut clock = 0.0;
    for (i, job) in jobs.iter_mut().enumerate() {
        match distr_type {
            "constant" => job.submit_time = i as f64 * step,
            "random" => {
                clock += rng.gen::<f64>() * 2.0 * step;
                job.submit_time = clock;
            }
            "poisson" => {
                // inverse-transform sample of the exponential inter-arrival
                clock += -step * (1.0 - rng.gen::<f64>()).ln();
                job.submit_time = clock;
            }
            other => {
                return Err(SimError::Config(format!("unknown distribution {other:?}")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_heatmap;
    use rand::SeedableRng;
    use serde_json::json;

    fn rng() -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(1)
    }

    #[test]
    fn test_random_generator_is_deterministic() {
        let hm = test_heatmap(&[("a", "a", Some(1.0)), ("b", "b", Some(1.0))]);
        let arg = json!({ "count": 20 });

        let jobs1 = generate_jobs("random", &arg, &hm, 64, &mut rng()).unwrap();
        let jobs2 = generate_jobs("random", &arg, &hm, 64, &mut rng()).unwrap();
        assert_eq!(jobs1.len(), 20);
        assert_eq!(jobs1, jobs2);

        for job in &jobs1 {
            assert!(job.num_of_processes >= 1 && job.num_of_processes <= 64);
            assert!(job.num_of_processes.is_power_of_two());
            assert!(job.remaining_time >= 50.0 && job.remaining_time <= 500.0);
            assert!(job.wall_time >= job.remaining_time);
        }
    }

    #[test]
    fn test_random_generator_respects_cluster_bound() {
        let hm = test_heatmap(&[("a", "a", Some(1.0))]);
        let arg = json!({ "count": 50, "procs": [1, 1024] });
        let jobs = generate_jobs("random", &arg, &hm, 16, &mut rng()).unwrap();
        assert!(jobs.iter().all(|j| j.num_of_processes <= 16));
    }

    #[test]
    fn test_keys_list_generator() {
        let hm = test_heatmap(&[]);
        let arg = json!([
            { "name": "lu", "procs": 8, "time": 100.0 },
            { "name": "mg", "procs": 4, "time": 50.0, "wall": 60.0 },
        ]);
        let jobs = generate_jobs("keys-list", &arg, &hm, 64, &mut rng()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_name, "lu");
        assert_eq!(jobs[0].wall_time, 200.0);
        assert_eq!(jobs[1].wall_time, 60.0);
        assert_eq!(jobs[1].job_id, 1);
    }

    #[test]
    fn test_keys_dict_generator() {
        let hm = test_heatmap(&[]);
        let arg = json!({
            "lu": { "count": 3, "procs": 8, "time": 100.0 },
            "mg": { "count": 1, "procs": 4, "time": 50.0 },
        });
        let jobs = generate_jobs("keys-dict", &arg, &hm, 64, &mut rng()).unwrap();
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs.iter().filter(|j| j.job_name == "lu").count(), 3);
        let ids: Vec<i64> = jobs.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unknown_generator_is_config_error() {
        let hm = test_heatmap(&[]);
        assert!(matches!(
            generate_jobs("genetic", &json!(1), &hm, 64, &mut rng()),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn test_constant_distribution() {
        let mut jobs = vec![
            Job::new(0, "a", 1, 1.0, 0.0, 2.0),
            Job::new(1, "a", 1, 1.0, 0.0, 2.0),
            Job::new(2, "a", 1, 1.0, 0.0, 2.0),
        ];
        apply_distribution(&mut jobs, "constant", 5.0, &mut rng()).unwrap();
        let submits: Vec<f64> = jobs.iter().map(|j| j.submit_time).collect();
        assert_eq!(submits, vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn test_poisson_distribution_is_monotone() {
        let mut jobs: Vec<Job> = (0..50)
            .map(|i| Job::new(i, "a", 1, 1.0, 0.0, 2.0))
            .collect();
        apply_distribution(&mut jobs, "poisson", 3.0, &mut rng()).unwrap();
        for pair in jobs.windows(2) {
            assert!(pair[0].submit_time <= pair[1].submit_time);
        }
        assert!(jobs.last().unwrap().submit_time > 0.0);
    }

    #[test]
    fn test_unknown_distribution_is_config_error() {
        let mut jobs = vec![Job::new(0, "a", 1, 1.0, 0.0, 2.0)];
        assert!(apply_distribution(&mut jobs, "zipf", 1.0, &mut rng()).is_err());
    }
}
