use async_trait::async_trait;
use futures::StreamExt;

use runnel_core::callbacks::RunType;
use runnel_core::chunk::{collect_chunks, once, Chunk, ChunkStream};
use runnel_core::config::RunnableConfig;
use runnel_core::error::Result;
use runnel_core::runnable::{BoxRunnable, Runnable};
use runnel_core::traced::{call_with_config, transform_with_config};

type Condition<I> = Box<dyn Fn(&I) -> bool + Send + Sync>;

/// Routes the input to the first branch whose condition holds, or to the
/// default branch when none does.
///
/// The chosen branch runs as a child tagged `branch:N` (1-based, in the
/// order branches were added) or `branch:default`.
pub struct RunnableBranch<I, O> {
    branches: Vec<(Condition<I>, BoxRunnable<I, O>)>,
    default: BoxRunnable<I, O>,
}

impl<I: Chunk, O: Chunk> RunnableBranch<I, O> {
    pub fn new<R>(default: R) -> Self
    where
        R: Runnable<Input = I, Output = O> + 'static,
    {
        Self {
            branches: Vec::new(),
            default: Box::new(default),
        }
    }

    pub fn when<F, R>(mut self, condition: F, branch: R) -> Self
    where
        F: Fn(&I) -> bool + Send + Sync + 'static,
        R: Runnable<Input = I, Output = O> + 'static,
    {
        self.branches.push((Box::new(condition), Box::new(branch)));
        self
    }

    fn select(&self, input: &I) -> (String, &BoxRunnable<I, O>) {
        self.branches
            .iter()
            .enumerate()
            .find(|(_, (condition, _))| condition(input))
            .map(|(i, (_, branch))| (format!("branch:{}", i + 1), branch))
            .unwrap_or_else(|| ("branch:default".to_string(), &self.default))
    }
}

#[async_trait]
impl<I: Chunk, O: Chunk> Runnable for RunnableBranch<I, O> {
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        "RunnableBranch".into()
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), RunType::Chain, input, config, |input, child| async move {
            let (tag, branch) = self.select(&input);
            branch.invoke_as_child(input, &child.tagged(tag)).await
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let traced_input = input.to_trace();
        transform_with_config(self.name(), RunType::Chain, Some(traced_input), config, move |child| {
            let (tag, branch) = self.select(&input);
            branch.transform_as_child(once(input), &child.tagged(tag))
        })
    }

    /// Conditions need the whole input, so it is buffered first.
    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let config = config.clone();
        Box::pin(async_stream::stream! {
            match collect_chunks(input).await {
                Ok(Some(whole)) => {
                    let mut inner = self.stream(whole, &config);
                    while let Some(item) = inner.next().await {
                        yield item;
                    }
                }
                Ok(None) => {}
                Err(e) => yield Err(e),
            }
        })
    }
}
