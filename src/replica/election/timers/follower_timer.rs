use crate::actor;
use crate::replica::election::timers::jitter::Jitter;
use crate::replica::election::timers::sync::{self, SharedOption};
use crate::replica::election::timers::time::{Clock, RealClock};
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

pub(crate) struct FollowerTimerHandle<C: Clock = RealClock> {
    next_wake_time: SharedOption<Instant>,
    timeout_range: RangeInclusive<Duration>,
    jitter: Jitter,
    clock: C,
    _to_drop: sync::Stopper,
}

struct FollowerTimerTask<C: Clock> {
    next_wake_time: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    clock: C,
    stop_check: sync::StopCheck,
    // timeout_backoff is a static amount of time that this task will wait between triggering
    // timeouts to the actor, so a stalled election doesn't spin the queue.
    timeout_backoff: Duration,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        jitter: Jitter,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = FollowerTimerTask::new(min_timeout, max_timeout, jitter, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> FollowerTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.next_wake_time.replace(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let rand_timeout = self.jitter.pick(self.timeout_range.clone());
        self.clock.now() + rand_timeout
    }
}

impl<C: Clock + Send + Sync + 'static> FollowerTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        jitter: Jitter,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, FollowerTimerHandle<C>) {
        let shared_opt = SharedOption::new();
        let (stopper, stop_check) = sync::stop_signal();

        let task = FollowerTimerTask {
            next_wake_time: shared_opt.clone(),
            actor_client,
            clock: clock.clone(),
            stop_check,
            timeout_backoff: min_timeout,
        };
        let handle = FollowerTimerHandle {
            next_wake_time: shared_opt,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            jitter,
            clock,
            _to_drop: stopper,
        };

        // Timer task must have a timeout value present when it starts, otherwise it may
        // trigger a timeout immediately after we become a follower.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    // We've received a leader heartbeat, so we sleep until the next timeout.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // We slept until `wake_time` and didn't receive another message. If the queue
                    // is still open, it means we haven't heard from the leader and we should start
                    // a new election. Keep this task running until Actor drops the queue. In case
                    // actor concurrently received an AppendEntries call and remains as Follower.
                    if self.stop_check.should_stop() {
                        return;
                    }
                    let _ = self.actor_client.follower_timeout().await;
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // The timer handle has dropped, which means we are no longer a follower for the
            // same term. Exit the task without starting a new election.
            if self.stop_check.should_stop() {
                return;
            }
        }
    }
}
