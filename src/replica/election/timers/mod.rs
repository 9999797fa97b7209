mod follower_timer;
mod jitter;
mod leader_timer;
mod sync;
mod time;

#[cfg(test)]
mod test_utils;

pub(crate) use jitter::Jitter;

pub(super) use follower_timer::FollowerTimerHandle;
pub(super) use leader_timer::LeaderTimerHandle;
