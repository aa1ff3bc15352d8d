// src/lib.rs

pub mod cli;
pub mod config;
pub mod coord;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::{CliArgs, Command, MarkArg};
use crate::coord::{CoordinatorConfig, spawn_coordinator};
use crate::engine::{Action, ActionOutput, EngineConfig, EngineContext, MarkStatus, dispatch};
use crate::errors::Result;
use crate::store::RunRecord;
use crate::types::DagRunRef;
use crate::worker::{Worker, WorkerConfig};

/// High-level entry point used by `main.rs`: builds the engine context and
/// executes one CLI command.
pub async fn run(args: CliArgs) -> Result<()> {
    let data_dir = args
        .data_dir
        .or_else(|| std::env::var("DAGFLOW_HOME").ok())
        .unwrap_or_else(|| ".dagflow".to_string());
    let dags_dir = args
        .dags_dir
        .or_else(|| std::env::var("DAGFLOW_DAGS").ok())
        .unwrap_or_else(|| "dags".to_string());
    let config = EngineConfig::new(data_dir, dags_dir);
    let ctx = Arc::new(EngineContext::new(config));

    match args.command {
        Command::Start {
            dag,
            params,
            run_id,
            queue,
        } => {
            let action = if queue {
                Action::Enqueue {
                    dag,
                    params,
                    run_id,
                }
            } else {
                Action::Start {
                    dag,
                    params,
                    run_id,
                }
            };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Stop { dag, run_id } => {
            let action = Action::Stop {
                dag_run: DagRunRef::new(dag, run_id),
            };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Retry { dag, run_id } => {
            let action = Action::Retry {
                dag_run: DagRunRef::new(dag, run_id),
            };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Reschedule {
            dag,
            run_id,
            new_run_id,
            params,
            new_dag,
        } => {
            let action = Action::Reschedule {
                dag_run: DagRunRef::new(dag, run_id),
                new_run_id,
                new_params: params,
                new_dag,
            };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Dequeue { dag, run_id } => {
            let action = Action::Dequeue {
                dag_run: DagRunRef::new(dag, run_id),
            };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Suspend { dag } => {
            let action = Action::ToggleSuspend { dag, suspend: true };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Resume { dag } => {
            let action = Action::ToggleSuspend {
                dag,
                suspend: false,
            };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Mark {
            dag,
            run_id,
            step,
            status,
        } => {
            let action = Action::MarkNode {
                dag_run: DagRunRef::new(dag, run_id),
                step,
                status: match status {
                    MarkArg::Success => MarkStatus::Success,
                    MarkArg::Error => MarkStatus::Error,
                },
            };
            print_output(dispatch(&ctx, action).await?);
        }

        Command::Status { dag, run_id } => match run_id {
            Some(run_id) => {
                let record = engine::status_by_run(&ctx, &DagRunRef::new(dag, run_id))?;
                print_record(&record);
            }
            None => match engine::latest_status(&ctx, &dag)? {
                Some(record) => print_record(&record),
                None => println!("no runs recorded for DAG '{dag}'"),
            },
        },

        Command::History { dag, limit } => {
            let records = engine::history(&ctx, &dag, limit)?;
            if records.is_empty() {
                println!("no runs recorded for DAG '{dag}'");
            }
            for record in records {
                print_record_line(&record);
            }
        }

        Command::Logs { dag, run_id, step } => {
            let content = engine::read_step_log(&ctx, &DagRunRef::new(dag, run_id), &step)?;
            print!("{content}");
        }

        Command::Queue => {
            let entries = ctx.queue.list()?;
            if entries.is_empty() {
                println!("queue is empty");
            }
            for entry in entries {
                println!(
                    "{}  queued at {}  ({:?})",
                    entry.dag_run, entry.enqueued_at, entry.priority
                );
            }
        }

        Command::Serve { workers, capacity } => {
            serve(ctx, workers, capacity).await?;
        }
    }

    Ok(())
}

/// Run the coordinator plus a local worker fleet until Ctrl-C.
async fn serve(ctx: Arc<EngineContext>, workers: usize, capacity: usize) -> Result<()> {
    let (handle, coordinator_join) =
        spawn_coordinator(Arc::clone(&ctx.queue), CoordinatorConfig::default());

    let shutdown = CancellationToken::new();
    let mut worker_joins = Vec::new();
    for i in 0..workers.max(1) {
        let worker = Worker::new(
            WorkerConfig::new(format!("worker-{i}"), capacity.max(1)),
            handle.clone(),
            Arc::clone(&ctx),
        );
        worker_joins.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    info!(workers = workers.max(1), capacity, "serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.map_err(anyhow::Error::from)?;
    info!("shutdown requested; draining workers");
    shutdown.cancel();

    for join in worker_joins {
        match join.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "worker exited with error"),
            Err(err) => tracing::warn!(error = %err, "worker task panicked"),
        }
    }
    drop(handle);
    let _ = coordinator_join.await;
    Ok(())
}

fn print_output(output: ActionOutput) {
    match output {
        ActionOutput::Started(record) => print_record(&record),
        ActionOutput::Queued(dag_run) => println!("{dag_run}: queued"),
        ActionOutput::Stopped(dag_run) => println!("{dag_run}: stop requested"),
        ActionOutput::Dequeued(dag_run) => println!("{dag_run}: dequeued"),
        ActionOutput::SuspendSet { dag, suspended } => {
            println!("{dag}: suspended = {suspended}");
        }
        ActionOutput::Marked(record) => print_record(&record),
    }
}

fn print_record(record: &RunRecord) {
    print_record_line(record);
    for node in record.nodes.iter().chain(record.hook_nodes.iter()) {
        let text = if node.status_text.is_empty() {
            String::new()
        } else {
            format!("  ({})", node.status_text)
        };
        println!("  - {:<24} {}{}", node.step.name, node.status, text);
    }
}

fn print_record_line(record: &RunRecord) {
    println!(
        "{}  {}  started={}  finished={}",
        record.dag_run,
        record.status,
        record
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        record
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    );
}
