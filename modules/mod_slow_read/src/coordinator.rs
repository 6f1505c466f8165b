use h2sec_harness::{verify_settings_ack, CheckContext, CheckError};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::budget::{SharePlanner, WindowBudget};
use crate::worker::Worker;

/// Dials connections until the configured concurrency is covered, runs one
/// worker per connection and folds their outcomes into one.
pub async fn run(ctx: &CheckContext) -> Result<(), CheckError> {
    let budget = WindowBudget::from_config(&ctx.config);
    let mut planner = SharePlanner::new(ctx.config.requests, ctx.config.concurrency);
    let mut workers = JoinSet::new();
    let mut index = 0;

    while !planner.is_done() {
        let mut conn = ctx.connect().await?;
        conn.handshake().await?;
        conn.write_settings(budget.settings()).await?;
        verify_settings_ack(&mut conn).await?;

        let share = planner.next_share(conn.settings().max_concurrent_streams());
        info!(
            connection = index,
            concurrent = share.concurrent,
            requests = share.requests,
            "starting worker"
        );
        let worker = Worker::new(index, conn, share, budget, ctx.config.common_headers());
        workers.spawn(worker.run());
        index += 1;
    }

    let mut outcome = Ok(());
    while let Some(joined) = workers.join_next().await {
        let result = joined.unwrap_or_else(|err| Err(CheckError::Transport(err.into())));
        if let Err(err) = result {
            warn!(error = %err, "worker failed");
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }
    outcome
}
