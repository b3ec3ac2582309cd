// common/src/primes.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::job::{Job, JobId, JobListener, JobState, Stored, TaskPool};
use crate::task::{Task, TaskId, TaskRequirements, Work};

/* --------- Cálculo (lo ejecuta el worker) --------- */

/// Cuenta primos en [low, high]. Devuelve `None` si `cancel` se activa.
pub fn count_primes(low: u64, high: u64, cancel: &AtomicBool) -> Option<u64> {
    let mut count = 0;
    for (i, n) in (low.max(2)..=high).enumerate() {
        if i % 4096 == 0 && cancel.load(Ordering::Relaxed) {
            return None;
        }
        if is_prime(n) {
            count += 1;
        }
    }
    Some(count)
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/* --------- Job de reducción --------- */

/// Cuenta los primos en [1, limit] partiendo el rango en `tasks` tramos.
/// Los parciales se combinan con tareas `sum` que participan del mismo
/// reparto que el resto, así la combinación se solapa con la delegación.
pub struct PrimeCountJob {
    name: String,
    limit: u64,
    ranges: Vec<(u64, u64)>,
    combine_threshold: usize,
    timeout: Option<Duration>,
    requirements: TaskRequirements,
    pool: TaskPool,
    partials: Vec<u64>,
    // tras una suma fallida el resto se combina en `final_result`
    combine_locally: bool,
    lost_ranges: usize,
}

impl PrimeCountJob {
    pub fn new(limit: u64, tasks: usize) -> Self {
        let limit = limit.max(1);
        let tasks = (tasks.max(1) as u64).min(limit) as usize;
        let digits = limit.to_string().len();

        let gap = limit / tasks as u64;
        let mut ranges = Vec::with_capacity(tasks);
        for i in 0..tasks as u64 {
            let low = i * gap + 1;
            let high = if i + 1 == tasks as u64 { limit } else { (i + 1) * gap };
            ranges.push((low, high));
        }

        Self {
            name: format!("primes-{}", limit),
            limit,
            ranges,
            combine_threshold: (tasks / digits).max(2),
            timeout: None,
            requirements: TaskRequirements::none(),
            pool: TaskPool::new(uuid::Uuid::new_v4().to_string()),
            partials: Vec::new(),
            combine_locally: false,
            lost_ranges: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn combine_threshold(&self) -> usize {
        self.combine_threshold
    }

    fn make_task(&self, work: Work) -> Task {
        let mut task = Task::new(self.pool.job_id().clone(), work)
            .with_requirements(self.requirements.clone());
        if let Some(timeout) = self.timeout {
            task = task.with_timeout(timeout);
        }
        task
    }

    fn maybe_combine(&mut self) {
        if self.combine_locally || self.partials.len() < 2 {
            return;
        }
        let nothing_else = self.pool.is_drained();
        if nothing_else || self.partials.len() >= self.combine_threshold {
            let operands = std::mem::take(&mut self.partials);
            debug!(
                job = %self.pool.job_id(),
                "combinando {} resultados parciales",
                operands.len()
            );
            let task = self.make_task(Work::Sum { operands });
            self.pool.push(task);
        }
    }
}

impl Job for PrimeCountJob {
    fn id(&self) -> &JobId {
        self.pool.job_id()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn make_ready(&mut self) {
        if self.pool.state() != JobState::New {
            return;
        }
        for &(low, high) in &self.ranges {
            let task = self.make_task(Work::CountPrimes { low, high });
            self.pool.push(task);
        }
        info!(
            job = %self.pool.job_id(),
            "job {} listo: {} tareas, combina de a {}",
            self.name,
            self.ranges.len(),
            self.combine_threshold
        );
        self.pool.set_state(JobState::Ready);
    }

    fn next_ready_task(&mut self) -> Option<Task> {
        self.pool.next()
    }

    fn has_next_task(&self) -> bool {
        self.pool.has_next()
    }

    fn store_task(&mut self, task: Task) {
        match self.pool.store(task) {
            Stored::Completed(task) => match task.result.as_ref().and_then(Value::as_u64) {
                Some(count) => self.partials.push(count),
                None => warn!(
                    job = %self.pool.job_id(),
                    task = task.id,
                    "resultado no numérico, se descarta"
                ),
            },
            Stored::Problematic(task) => match task.work {
                Work::Sum { operands } => {
                    warn!(
                        job = %self.pool.job_id(),
                        task = task.id,
                        "la suma falló, sus {} parciales vuelven al job",
                        operands.len()
                    );
                    self.partials.extend(operands);
                    self.combine_locally = true;
                }
                _ => {
                    warn!(
                        job = %self.pool.job_id(),
                        task = task.id,
                        "tramo perdido, el job no tendrá un total exacto"
                    );
                    self.lost_ranges += 1;
                }
            },
            Stored::Ignored => return,
            Stored::Requeued => {}
        }

        self.maybe_combine();

        if self.pool.is_drained() {
            info!(job = %self.pool.job_id(), "job {} completo", self.name);
            self.pool.set_state(JobState::Completed);
        }
    }

    fn return_task(&mut self, task: Task) {
        self.pool.give_back(task);
    }

    fn initial_count(&self) -> usize {
        self.ranges.len()
    }

    fn remaining_count(&self) -> usize {
        self.pool.pending_len() + self.pool.in_flight_len()
    }

    fn completed_count(&self) -> usize {
        self.pool.completed()
    }

    fn failed_count(&self) -> usize {
        self.pool.failed().len()
    }

    fn final_result(&self) -> Option<Value> {
        if self.pool.state() != JobState::Completed || self.lost_ranges > 0 {
            return None;
        }
        match self.partials.as_slice() {
            [total] => Some(json!(total)),
            [] => None,
            many => Some(json!(many.iter().sum::<u64>())),
        }
    }

    fn state(&self) -> JobState {
        self.pool.state()
    }

    fn set_listener(&mut self, listener: JobListener) {
        self.pool.set_listener(listener);
    }

    fn cancel_tasks(&self, tasks: Option<Vec<TaskId>>) {
        self.pool.request_cancel(tasks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::MAX_TASK_ATTEMPTS;
    use crate::task::TaskState;

    fn run(task: &Task) -> u64 {
        let never = AtomicBool::new(false);
        match &task.work {
            Work::CountPrimes { low, high } => count_primes(*low, *high, &never).unwrap(),
            Work::Sum { operands } => operands.iter().sum(),
            other => panic!("trabajo inesperado {:?}", other),
        }
    }

    fn complete(mut task: Task) -> Task {
        task.result = Some(json!(run(&task)));
        task.state = TaskState::Completed;
        task
    }

    #[test]
    fn counts_small_ranges() {
        let never = AtomicBool::new(false);
        assert_eq!(count_primes(1, 10, &never), Some(4));
        assert_eq!(count_primes(11, 20, &never), Some(4));
        assert_eq!(count_primes(1, 1, &never), Some(0));
        assert_eq!(count_primes(1, 1000, &never), Some(168));
    }

    #[test]
    fn cancelled_count_returns_none() {
        let cancelled = AtomicBool::new(true);
        assert_eq!(count_primes(1, 100_000, &cancelled), None);
    }

    #[test]
    fn ranges_cover_the_whole_interval() {
        let job = PrimeCountJob::new(1000, 7);
        assert_eq!(job.ranges.first().map(|r| r.0), Some(1));
        assert_eq!(job.ranges.last().map(|r| r.1), Some(1000));
        for w in job.ranges.windows(2) {
            assert_eq!(w[0].1 + 1, w[1].0);
        }
    }

    #[test]
    fn threshold_follows_task_count_and_digits() {
        assert_eq!(PrimeCountJob::new(1000, 30).combine_threshold(), 7);
        assert_eq!(PrimeCountJob::new(1000, 4).combine_threshold(), 2);
    }

    #[test]
    fn sequential_run_reaches_the_exact_count() {
        let mut job = PrimeCountJob::new(10_000, 12);
        job.make_ready();

        let mut rounds = 0;
        while job.state() != JobState::Completed {
            let task = job.next_ready_task().expect("debe haber trabajo");
            job.store_task(complete(task));
            rounds += 1;
            assert!(rounds < 100);
        }

        assert_eq!(job.final_result(), Some(json!(1229)));
        assert!(job.completed_count() > 12);
    }

    #[test]
    fn combine_task_is_queued_while_work_is_still_in_flight() {
        // 9 tramos de un número de 2 dígitos: se combina de a 4
        let mut job = PrimeCountJob::new(90, 9);
        job.make_ready();
        assert_eq!(job.combine_threshold(), 4);

        let taken: Vec<Task> = (0..9).map(|_| job.next_ready_task().unwrap()).collect();
        assert!(!job.has_next_task());

        let mut it = taken.into_iter();
        for task in it.by_ref().take(4) {
            job.store_task(complete(task));
        }

        // quedan 5 en vuelo y ya hay una suma encolada
        let combine = job.next_ready_task().expect("suma encolada");
        assert!(matches!(combine.work, Work::Sum { ref operands } if operands.len() == 4));
        assert_eq!(job.state(), JobState::Running);

        job.store_task(complete(combine));
        for task in it {
            job.store_task(complete(task));
        }
        while job.state() != JobState::Completed {
            let task = job.next_ready_task().unwrap();
            job.store_task(complete(task));
        }
        assert_eq!(job.final_result(), Some(json!(24)));
    }

    #[test]
    fn failed_range_is_requeued() {
        let mut job = PrimeCountJob::new(100, 2);
        job.make_ready();
        let mut first = job.next_ready_task().unwrap();
        let first_id = first.id;
        first.state = TaskState::Troubled;
        job.store_task(first);

        let second = job.next_ready_task().unwrap();
        let again = job.next_ready_task().unwrap();
        assert_eq!(again.id, first_id);
        job.store_task(complete(second));
        job.store_task(complete(again));
        while job.state() != JobState::Completed {
            let t = job.next_ready_task().unwrap();
            job.store_task(complete(t));
        }
        assert_eq!(job.final_result(), Some(json!(25)));
    }

    #[test]
    fn failed_combine_gives_its_partials_back() {
        let mut job = PrimeCountJob::new(100, 4);
        job.make_ready();
        let ranges: Vec<Task> = (0..4).map(|_| job.next_ready_task().unwrap()).collect();
        let mut it = ranges.into_iter();
        for task in it.by_ref().take(2) {
            job.store_task(complete(task));
        }

        for _ in 0..MAX_TASK_ATTEMPTS {
            let mut combine = job.next_ready_task().expect("suma encolada");
            assert!(matches!(combine.work, Work::Sum { ref operands } if operands.len() == 2));
            combine.state = TaskState::Troubled;
            job.store_task(combine);
        }
        assert_eq!(job.failed_count(), 1);

        for task in it {
            job.store_task(complete(task));
        }
        assert!(!job.has_next_task());
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.final_result(), Some(json!(25)));
    }

    #[test]
    fn lost_range_leaves_no_final_result() {
        let mut job = PrimeCountJob::new(100, 2);
        job.make_ready();
        let mut failing = job.next_ready_task().unwrap();
        let other = job.next_ready_task().unwrap();
        job.store_task(complete(other));

        loop {
            failing.state = TaskState::Terminated;
            job.store_task(failing);
            match job.next_ready_task() {
                Some(again) => failing = again,
                None => break,
            }
        }

        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.failed_count(), 1);
        assert_eq!(job.final_result(), None);
        assert_eq!(job.report().failed_tasks, 1);
    }
}
