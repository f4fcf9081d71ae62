//! Deployment scheduler.
//!
//! Walks the deployment graph of a module, reusing what the ledger already has
//! confirmed and submitting the rest through the chain client. Specs whose
//! dependencies are all confirmed are started in deployment order, up to
//! `concurrency` of them in flight at once. Ledger writes happen on the scheduler
//! task only, so they are linearizable per key.
//!
//! Per spec:
//!
//! ```text
//! NotStarted -> Resolving -> Submitting -> AwaitingReceipt -> Confirmed
//!                    \             \               \
//!                     +-------------+---------------+----> Failed
//! NotStarted -> Skipped (upstream failure or cancellation)
//! ```

use std::collections::BTreeMap;

use alloy_core::primitives::{Address, TxHash};
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio::{sync::watch, time::error::Elapsed};

use crate::{
    artifacts::ArtifactProvider,
    chain::{ChainClient, DeployRequest, PendingDeployment, Receipt},
    config::{Network, SchedulerConfig},
    deployment_hash::fingerprint,
    error::{ChainError, DeployError, LedgerError, RunError, SkipReason},
    graph::DeploymentGraph,
    ledger::{Ledger, LedgerEntry, LedgerKey, LedgerStatus},
    module::{DeploymentSpec, Module},
    report::{DeploymentReport, SpecOutcome, SpecReport},
    resolver::resolve,
};

/// Lifecycle of a single spec within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SpecState {
    NotStarted,
    Resolving,
    Submitting,
    AwaitingReceipt,
    Confirmed,
    Failed,
    Skipped,
}

/// Everything a run needs besides the module itself.
pub struct DeployContext<'a, L, C, A> {
    pub network: &'a Network,
    /// Values for `env` constructor arguments.
    pub env: &'a BTreeMap<String, String>,
    pub ledger: &'a mut L,
    pub chain: &'a C,
    pub artifacts: &'a A,
}

/// Requests cancellation of the runs holding the paired [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Cancellation signal observed by the scheduler.
///
/// Once cancelled, no new deployment starts. Deployments already submitted keep
/// waiting for their receipt (bounded by the receipt timeout) and are recorded.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested; never if the trigger is dropped first.
    pub async fn cancelled(&mut self) {
        let closed = self.0.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_shutdown(shutdown: Option<&mut Shutdown>) {
    match shutdown {
        Some(shutdown) => shutdown.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Orchestrates the deployment of modules.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
    shutdown: Option<Shutdown>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Deploy `module` on `ctx.network`.
    ///
    /// Fails before any submission if the module is invalid (duplicate names,
    /// unknown reference, cycle), and mid-run only if the ledger cannot be read or
    /// written. Per-spec failures are reported in the returned report.
    pub async fn run<L, C, A>(
        &self,
        module: &Module,
        ctx: DeployContext<'_, L, C, A>,
    ) -> Result<DeploymentReport, RunError>
    where
        L: Ledger,
        C: ChainClient,
        A: ArtifactProvider,
    {
        let graph = DeploymentGraph::build(module)?;

        tracing::info!(
            module = %module.name,
            network = %ctx.network.name,
            chain_id = ctx.network.chain_id,
            deployments = module.deployments.len(),
            "Starting deployment run..."
        );

        let count = module.deployments.len();
        let run = Run {
            module,
            graph,
            ctx,
            config: &self.config,
            shutdown: self.shutdown.clone(),
            states: vec![SpecState::NotStarted; count],
            reconciled: vec![false; count],
            outcomes: (0..count).map(|_| None).collect(),
            deployed: BTreeMap::new(),
            in_flight: FuturesUnordered::new(),
            cancelled: false,
        };
        run.execute().await
    }
}

/// Completion of an asynchronous step of a spec.
enum Step<P> {
    Submitted {
        index: usize,
        result: Result<Result<P, ChainError>, Elapsed>,
    },
    Mined {
        index: usize,
        tx_hash: TxHash,
        result: Result<Result<Receipt, ChainError>, Elapsed>,
    },
    Reconciled {
        index: usize,
        tx_hash: TxHash,
        /// Status of the ledger entry being reconciled.
        status: LedgerStatus,
        result: Result<Result<Option<Receipt>, ChainError>, Elapsed>,
    },
}

enum Event<P> {
    Step(Step<P>),
    Cancelled,
}

/// What the ledger already knows about a spec.
enum Prior {
    Reuse { address: Address, fingerprint: String },
    Reconcile { tx_hash: TxHash, status: LedgerStatus },
    Fresh,
}

struct Run<'a, L, C: ChainClient, A> {
    module: &'a Module,
    graph: DeploymentGraph<'a>,
    ctx: DeployContext<'a, L, C, A>,
    config: &'a SchedulerConfig,
    shutdown: Option<Shutdown>,
    states: Vec<SpecState>,
    /// Specs whose recorded transaction was already looked up in this run.
    reconciled: Vec<bool>,
    outcomes: Vec<Option<SpecOutcome>>,
    /// Addresses available to dependents, by spec name.
    deployed: BTreeMap<String, Address>,
    in_flight: FuturesUnordered<BoxFuture<'a, Step<C::Pending>>>,
    cancelled: bool,
}

impl<'a, L, C, A> Run<'a, L, C, A>
where
    L: Ledger,
    C: ChainClient,
    A: ArtifactProvider,
{
    async fn execute(mut self) -> Result<DeploymentReport, RunError> {
        loop {
            self.schedule()?;

            if self.in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                step = self.in_flight.next() => match step {
                    Some(step) => Event::Step(step),
                    None => break,
                },
                _ = wait_for_shutdown(self.shutdown.as_mut()), if !self.cancelled => Event::Cancelled,
            };

            match event {
                Event::Step(step) => self.handle(step)?,
                Event::Cancelled => self.cancel(),
            }
        }

        Ok(self.into_report())
    }

    fn spec(&self, index: usize) -> &'a DeploymentSpec {
        &self.module.deployments[index]
    }

    fn key(&self, index: usize) -> LedgerKey {
        LedgerKey::new(
            self.ctx.network.chain_id,
            &self.module.name,
            &self.spec(index).name,
        )
    }

    fn transition(&mut self, index: usize, state: SpecState) {
        tracing::trace!(
            spec = %self.spec(index).name,
            from = %self.states[index],
            to = %state,
            "Deployment state changed"
        );
        self.states[index] = state;
    }

    /// Start every spec that can start, until nothing changes.
    fn schedule(&mut self) -> Result<(), RunError> {
        if !self.cancelled && self.shutdown.as_ref().is_some_and(Shutdown::is_cancelled) {
            self.cancel();
        }

        let limit = self.config.concurrency.max(1);
        let mut progressed = true;

        while progressed {
            progressed = false;

            for pos in 0..self.graph.order().len() {
                let index = self.graph.order()[pos];
                if self.states[index] != SpecState::NotStarted {
                    continue;
                }

                if self.cancelled {
                    self.skip(index, SkipReason::Cancelled);
                    progressed = true;
                    continue;
                }

                if let Some(upstream) = self.failed_upstream(index) {
                    self.skip(index, SkipReason::UpstreamFailure { upstream });
                    progressed = true;
                    continue;
                }

                if !self
                    .graph
                    .dependencies(index)
                    .iter()
                    .all(|&dep| self.states[dep] == SpecState::Confirmed)
                {
                    continue;
                }

                match self.prior(index)? {
                    Prior::Reuse {
                        address,
                        fingerprint,
                    } => {
                        self.reuse(index, address, &fingerprint);
                        progressed = true;
                    }
                    _ if self.in_flight.len() >= limit => {}
                    Prior::Reconcile { tx_hash, status } => self.reconcile(index, tx_hash, status),
                    Prior::Fresh => {
                        self.submit(index);
                        progressed = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Name of the failure that prevents `index` from ever starting.
    fn failed_upstream(&self, index: usize) -> Option<String> {
        self.graph.dependencies(index).iter().find_map(|&dep| {
            match (self.states[dep], &self.outcomes[dep]) {
                (SpecState::Failed, _) => Some(self.spec(dep).name.clone()),
                (
                    SpecState::Skipped,
                    Some(SpecOutcome::Skipped {
                        reason: SkipReason::UpstreamFailure { upstream },
                    }),
                ) => Some(upstream.clone()),
                (SpecState::Skipped, _) => Some(self.spec(dep).name.clone()),
                _ => None,
            }
        })
    }

    fn prior(&self, index: usize) -> Result<Prior, RunError> {
        let Some(entry) = self.ctx.ledger.get(&self.key(index))? else {
            return Ok(Prior::Fresh);
        };

        Ok(match (entry.status, entry.address, entry.tx_hash) {
            (LedgerStatus::Confirmed, Some(address), _) if !self.config.redeploy => {
                Prior::Reuse {
                    address,
                    fingerprint: entry.fingerprint,
                }
            }
            // A failed entry with a transaction may have failed on the way back
            // from the node, not on chain.
            (status @ (LedgerStatus::Pending | LedgerStatus::Failed), _, Some(tx_hash))
                if !self.reconciled[index] =>
            {
                Prior::Reconcile { tx_hash, status }
            }
            _ => Prior::Fresh,
        })
    }

    fn reuse(&mut self, index: usize, address: Address, recorded: &str) {
        let spec = self.spec(index);
        if recorded != fingerprint(spec) {
            tracing::warn!(
                spec = %spec.name,
                %address,
                "Deployment declaration changed since it was deployed; reusing the recorded address (use redeploy to deploy again)"
            );
        }
        tracing::info!(spec = %spec.name, %address, "Already deployed, reusing");

        self.deployed.insert(spec.name.clone(), address);
        self.transition(index, SpecState::Confirmed);
        self.outcomes[index] = Some(SpecOutcome::Reused { address });
    }

    fn reconcile(&mut self, index: usize, tx_hash: TxHash, status: LedgerStatus) {
        tracing::info!(
            spec = %self.spec(index).name,
            %tx_hash,
            %status,
            "Found transaction from an earlier run, checking its receipt..."
        );
        self.reconciled[index] = true;
        self.transition(index, SpecState::AwaitingReceipt);

        let chain = self.ctx.chain;
        let timeout = self.config.receipt_timeout();
        self.in_flight.push(
            async move {
                let result = tokio::time::timeout(timeout, chain.receipt(tx_hash)).await;
                Step::Reconciled {
                    index,
                    tx_hash,
                    status,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn submit(&mut self, index: usize) {
        let spec = self.spec(index);
        self.transition(index, SpecState::Resolving);

        let request = match self.prepare(spec) {
            Ok(request) => request,
            Err(error) => {
                self.fail(index, error);
                return;
            }
        };

        tracing::info!(
            spec = %spec.name,
            contract = %spec.contract,
            signer = spec.signer,
            args = ?request.args.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Deploying..."
        );
        self.transition(index, SpecState::Submitting);

        let chain = self.ctx.chain;
        let timeout = self.config.receipt_timeout();
        self.in_flight.push(
            async move {
                let result = tokio::time::timeout(timeout, chain.deploy(&request)).await;
                Step::Submitted { index, result }
            }
            .boxed(),
        );
    }

    /// Resolve arguments and encode the creation transaction.
    fn prepare(&self, spec: &DeploymentSpec) -> Result<DeployRequest, DeployError> {
        let args = resolve(&spec.args, &self.deployed, self.ctx.env)?;
        let artifact = self.ctx.artifacts.artifact(&spec.contract)?;
        let data = artifact.deploy_data(&args)?;

        Ok(DeployRequest {
            name: spec.name.clone(),
            contract: spec.contract.clone(),
            args,
            data,
            signer: spec.signer,
        })
    }

    fn handle(&mut self, step: Step<C::Pending>) -> Result<(), RunError> {
        match step {
            Step::Submitted {
                index,
                result: Ok(Ok(pending)),
            } => {
                let tx_hash = pending.tx_hash();
                if let Err(source) =
                    self.record(index, LedgerStatus::Pending, Some(tx_hash), None, None)
                {
                    let spec = self.spec(index).name.clone();
                    tracing::error!(
                        %spec,
                        %tx_hash,
                        error = %source,
                        "Submitted transaction could not be recorded, check it before running again"
                    );
                    return Err(RunError::Unrecorded {
                        spec,
                        tx_hash,
                        source,
                    });
                }
                self.transition(index, SpecState::AwaitingReceipt);
                tracing::info!(spec = %self.spec(index).name, %tx_hash, "Submitted, awaiting receipt...");

                let timeout = self.config.receipt_timeout();
                self.in_flight.push(
                    async move {
                        let result = tokio::time::timeout(timeout, pending.await_receipt()).await;
                        Step::Mined {
                            index,
                            tx_hash,
                            result,
                        }
                    }
                    .boxed(),
                );
            }
            Step::Submitted {
                index,
                result: Ok(Err(error)),
            } => {
                self.record(index, LedgerStatus::Failed, None, None, Some(error.to_string()))?;
                self.fail(index, error.into());
            }
            Step::Submitted {
                index,
                result: Err(_),
            } => {
                let error = DeployError::SubmissionTimeout {
                    after: self.config.receipt_timeout(),
                };
                self.record(index, LedgerStatus::Failed, None, None, Some(error.to_string()))?;
                self.fail(index, error);
            }
            Step::Mined {
                index,
                tx_hash,
                result: Ok(Ok(receipt)),
            } => {
                self.confirm(index, receipt)?;
                self.outcomes[index] = Some(SpecOutcome::Deployed {
                    address: receipt.address,
                    tx_hash,
                });
            }
            Step::Mined {
                index,
                tx_hash,
                result:
                    Ok(Err(
                        error @ (ChainError::Reverted { .. }
                        | ChainError::MissingContractAddress { .. }),
                    )),
            } => {
                self.record(
                    index,
                    LedgerStatus::Failed,
                    Some(tx_hash),
                    None,
                    Some(error.to_string()),
                )?;
                self.fail(index, error.into());
            }
            Step::Mined {
                index,
                tx_hash,
                result: Ok(Err(error)),
            } => {
                // Nothing is known about the transaction: keep it pending.
                self.fail(index, DeployError::ReceiptUnavailable { tx_hash, error });
            }
            Step::Mined {
                index,
                tx_hash,
                result: Err(_),
            } => {
                // The transaction may still be mined; the entry stays pending so the
                // next run reconciles it instead of submitting again.
                let after = self.config.receipt_timeout();
                self.fail(index, DeployError::Timeout { tx_hash, after });
            }
            Step::Reconciled {
                index,
                result: Ok(Ok(Some(receipt))),
                ..
            } => {
                self.confirm(index, receipt)?;
                self.outcomes[index] = Some(SpecOutcome::Reused {
                    address: receipt.address,
                });
            }
            Step::Reconciled {
                index,
                tx_hash,
                status: LedgerStatus::Failed,
                result: Ok(Ok(None)),
            } => {
                tracing::info!(
                    spec = %self.spec(index).name,
                    %tx_hash,
                    "Failed transaction is unknown to the node, deploying again"
                );
                self.transition(index, SpecState::NotStarted);
            }
            Step::Reconciled {
                index,
                tx_hash,
                result: Ok(Ok(None)),
                ..
            } => {
                self.fail(index, DeployError::PendingReconciliation { tx_hash });
            }
            Step::Reconciled {
                index,
                tx_hash,
                result:
                    Ok(Err(
                        error @ (ChainError::Reverted { .. }
                        | ChainError::MissingContractAddress { .. }),
                    )),
                ..
            } => {
                tracing::warn!(
                    spec = %self.spec(index).name,
                    %tx_hash,
                    %error,
                    "Earlier transaction failed on chain, deploying again"
                );
                self.record(
                    index,
                    LedgerStatus::Failed,
                    Some(tx_hash),
                    None,
                    Some(error.to_string()),
                )?;
                self.transition(index, SpecState::NotStarted);
            }
            Step::Reconciled {
                index,
                tx_hash,
                result: Ok(Err(error)),
                ..
            } => {
                self.fail(index, DeployError::ReceiptUnavailable { tx_hash, error });
            }
            Step::Reconciled {
                index,
                tx_hash,
                result: Err(_),
                ..
            } => {
                let after = self.config.receipt_timeout();
                self.fail(index, DeployError::Timeout { tx_hash, after });
            }
        }
        Ok(())
    }

    fn confirm(&mut self, index: usize, receipt: Receipt) -> Result<(), RunError> {
        self.record(
            index,
            LedgerStatus::Confirmed,
            Some(receipt.tx_hash),
            Some(receipt.address),
            None,
        )?;

        let spec = self.spec(index);
        tracing::info!(
            spec = %spec.name,
            contract = %spec.contract,
            address = %receipt.address,
            tx_hash = %receipt.tx_hash,
            block = ?receipt.block_number,
            "{} deployed to: {}",
            spec.contract,
            receipt.address
        );

        self.deployed.insert(spec.name.clone(), receipt.address);
        self.transition(index, SpecState::Confirmed);
        Ok(())
    }

    fn record(
        &mut self,
        index: usize,
        status: LedgerStatus,
        tx_hash: Option<TxHash>,
        address: Option<Address>,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let spec = self.spec(index);
        let entry = LedgerEntry {
            chain_id: self.ctx.network.chain_id,
            network: self.ctx.network.name.clone(),
            module: self.module.name.clone(),
            spec: spec.name.clone(),
            contract: spec.contract.clone(),
            status,
            address,
            tx_hash,
            error,
            fingerprint: fingerprint(spec),
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.ctx.ledger.put(entry)
    }

    fn fail(&mut self, index: usize, error: DeployError) {
        tracing::warn!(spec = %self.spec(index).name, %error, "Deployment failed");
        self.transition(index, SpecState::Failed);
        self.outcomes[index] = Some(SpecOutcome::Failed { error });
    }

    fn skip(&mut self, index: usize, reason: SkipReason) {
        tracing::warn!(spec = %self.spec(index).name, %reason, "Deployment skipped");
        self.transition(index, SpecState::Skipped);
        self.outcomes[index] = Some(SpecOutcome::Skipped { reason });
    }

    fn cancel(&mut self) {
        tracing::warn!(
            in_flight = self.in_flight.len(),
            "Cancellation requested, no new deployment will start"
        );
        self.cancelled = true;
    }

    fn into_report(self) -> DeploymentReport {
        let mut outcomes = self.outcomes;
        let specs = self
            .graph
            .order()
            .iter()
            .map(|&index| {
                let spec = &self.module.deployments[index];
                SpecReport {
                    name: spec.name.clone(),
                    contract: spec.contract.clone(),
                    // Every spec reaches a terminal state before the loop exits.
                    outcome: outcomes[index].take().unwrap_or(SpecOutcome::Skipped {
                        reason: SkipReason::Cancelled,
                    }),
                }
            })
            .collect();

        DeploymentReport {
            module: self.module.name.clone(),
            network: self.ctx.network.name.clone(),
            chain_id: self.ctx.network.chain_id,
            specs,
        }
    }
}
