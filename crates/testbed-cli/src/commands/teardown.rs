use testbed_core::{ChangeId, CommandRunner, TestbedConfig};
use testbed_provision::{Teardown, TeardownReport};

use super::tunneled;

pub async fn teardown<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &TestbedConfig,
    change: &ChangeId,
) -> anyhow::Result<TeardownReport> {
    tunneled(config, async {
        Ok::<_, anyhow::Error>(Teardown::new(runner, config).run(change).await?)
    })
    .await
}
