use async_trait::async_trait;

use runnel_core::callbacks::RunType;
use runnel_core::chunk::{once, ChunkStream};
use runnel_core::config::RunnableConfig;
use runnel_core::error::Result;
use runnel_core::runnable::Runnable;
use runnel_core::traced::{call_with_config, transform_with_config};

/// Passes model text through unchanged, chunk by chunk when streaming.
///
/// Records a parser run, so it shows up in traces like any other step.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringOutputParser;

#[async_trait]
impl Runnable for StringOutputParser {
    type Input = String;
    type Output = String;

    fn name(&self) -> String {
        "StringOutputParser".into()
    }

    fn run_type(&self) -> RunType {
        RunType::Parser
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), RunType::Parser, input, config, |input, _child| async move {
            Ok(input)
        })
        .await
    }

    fn stream<'a>(&'a self, input: String, config: &RunnableConfig) -> ChunkStream<'a, String> {
        self.transform(once(input), config)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, String>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, String> {
        transform_with_config(self.name(), RunType::Parser, None, config, move |_child| input)
    }
}
