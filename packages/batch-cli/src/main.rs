// Thin command-line client: one subcommand per batch request type the
// core serves. Exit codes: 0 success, 1 authentication failure,
// 2 usage error, otherwise the batch error code folded to a byte.

use anyhow::{Context, Result};
use batch_core::dispatch::reply::{read_reply, BatchReply, ReplyBody};
use batch_core::dispatch::request::{write_request, BatchRequest, ReqBody, ReqType, StatusBody};
use batch_core::domains::attr::{SetOp, WireAttr};
use batch_core::Config;
use clap::{Parser, Subcommand};
use tokio::net::TcpStream;
use wire::{DisChan, TimeoutClass};

#[derive(Parser)]
#[command(name = "batch", about = "Batch workload manager client")]
struct Cli {
    /// Server host (defaults to PBS_SERVER from the config)
    #[arg(long)]
    server: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// User name presented in the request header
    #[arg(long, default_value_t = whoami())]
    user: String,

    /// Emit status output as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a job: queue, script, commit
    Submit {
        #[arg(long, default_value = "")]
        queue: String,
        /// name=value attribute pairs
        #[arg(long = "attr")]
        attrs: Vec<String>,
        /// resource=value entries for Resource_List
        #[arg(long = "resource")]
        resources: Vec<String>,
        /// Script file path; "-" reads stdin
        script: String,
    },
    /// Delete a job
    Delete { jobid: String },
    /// Delete many jobs in one request
    DeleteList {
        jobids: Vec<String>,
        #[arg(long)]
        resume_from: Option<String>,
    },
    /// Hold a job
    Hold {
        jobid: String,
        #[arg(default_value = "u")]
        holds: String,
    },
    /// Release a hold
    Release {
        jobid: String,
        #[arg(default_value = "u")]
        holds: String,
    },
    /// Modify job attributes
    Modify {
        jobid: String,
        #[arg(long = "attr")]
        attrs: Vec<String>,
    },
    /// Move a job to another queue or server
    Move { jobid: String, destination: String },
    /// Swap the queue order of two jobs
    Order { job1: String, job2: String },
    /// Run a job on a placement (manager)
    Run { jobid: String, exec_vnode: String },
    /// Run asynchronously; the ack arrives later
    Asyrun { jobid: String, exec_vnode: String },
    /// Signal a job
    Signal { jobid: String, signame: String },
    /// Send a message to a job's output
    Msg {
        jobid: String,
        text: String,
        #[arg(long, default_value_t = 2)]
        file: u64,
    },
    /// Requeue a running job
    Rerun { jobid: String },
    /// Where does this job live
    Locate { jobid: String },
    /// Job status
    StatJob {
        #[arg(default_value = "")]
        jobid: String,
    },
    /// Queue status
    StatQue {
        #[arg(default_value = "")]
        queue: String,
    },
    /// Server status
    StatSvr,
    /// Scheduler status
    StatSched,
    /// Node status
    StatNode {
        #[arg(default_value = "")]
        node: String,
    },
    /// Reservation status
    StatResv {
        #[arg(default_value = "")]
        resvid: String,
    },
    /// Select jobs by criteria
    Select {
        #[arg(long = "attr")]
        attrs: Vec<String>,
    },
    /// Manager operation: (create|delete|set|unset) (server|queue|node|sched) name
    Manager {
        cmd: String,
        obj: String,
        name: String,
        #[arg(long = "attr")]
        attrs: Vec<String>,
    },
    /// Ask the server to shut down
    Shutdown,
    /// Resource availability query
    Rescq { resources: Vec<String> },
    /// Submit a reservation
    SubmitResv {
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,
        #[arg(long = "resource")]
        resources: Vec<String>,
    },
    /// Confirm a reservation (manager)
    ConfirmResv {
        resvid: String,
        exec_vnode: String,
        #[arg(long)]
        start: i64,
    },
    /// Delete a reservation
    DeleteResv { resvid: String },
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "nobody".to_string())
}

fn parse_attr(spec: &str) -> Result<WireAttr> {
    let (name, value) = spec
        .split_once('=')
        .with_context(|| format!("attribute {spec} is not name=value"))?;
    Ok(match name.split_once('.') {
        Some((name, resource)) => WireAttr::with_resource(name, resource, value),
        None => WireAttr::new(name, value),
    })
}

fn resource_attrs(resources: &[String]) -> Result<Vec<WireAttr>> {
    resources
        .iter()
        .map(|spec| {
            let (res, value) = spec
                .split_once('=')
                .with_context(|| format!("resource {spec} is not name=value"))?;
            Ok(WireAttr::with_resource("Resource_List", res, value))
        })
        .collect()
}

struct Client {
    chan: DisChan<TcpStream>,
    user: String,
}

impl Client {
    async fn connect(server: &str, port: u16, user: &str) -> Result<Client> {
        let stream = TcpStream::connect((server, port))
            .await
            .with_context(|| format!("connecting to {server}:{port}"))?;
        let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
        let mut chan = DisChan::new(stream);
        chan.set_timeout(TimeoutClass::Short);
        let mut client = Client {
            chan,
            user: user.to_string(),
        };
        // handshake first; nothing else is accepted before it
        let auth = BatchRequest::new(
            ReqType::Authenticate,
            user,
            ReqBody::Authenticate {
                method: "resvport".into(),
                encrypt_method: String::new(),
                client_port: local_port,
            },
        );
        let reply = client.round_trip(auth).await?;
        if reply.is_err() {
            eprintln!("authentication failed: {}", reply_text(&reply));
            std::process::exit(1);
        }
        Ok(client)
    }

    async fn round_trip(&mut self, req: BatchRequest) -> Result<BatchReply> {
        write_request(&mut self.chan, &req);
        self.chan.flush().await?;
        let (_ver, reply) = read_reply(&mut self.chan).await?;
        Ok(reply)
    }

    fn request(&self, req_type: ReqType, body: ReqBody) -> BatchRequest {
        BatchRequest::new(req_type, &self.user, body)
    }
}

fn reply_text(reply: &BatchReply) -> String {
    match &reply.body {
        ReplyBody::Text { text, .. } => text.clone(),
        _ => format!("code {}", reply.code),
    }
}

fn finish(reply: BatchReply, json: bool) -> ! {
    if reply.is_err() {
        eprintln!("{}", reply_text(&reply));
        std::process::exit((reply.code % 256) as i32);
    }
    match reply.body {
        ReplyBody::Null => {}
        ReplyBody::JobId(id) | ReplyBody::Locate(id) => println!("{id}"),
        ReplyBody::Select(ids) => {
            for id in ids {
                println!("{id}");
            }
        }
        ReplyBody::Status(entries) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&entries).expect("status serializes")
                );
            } else {
                for e in entries {
                    println!("{}:", e.name);
                    for a in e.attrs {
                        match a.resource {
                            Some(r) => println!("    {}.{r} = {}", a.name, a.value),
                            None => println!("    {} = {}", a.name, a.value),
                        }
                    }
                }
            }
        }
        ReplyBody::Text { text, .. } => println!("{text}"),
        ReplyBody::RescQuery {
            avail,
            alloc,
            resvd,
            down,
        } => {
            for i in 0..avail.len() {
                println!(
                    "available={} allocated={} reserved={} down={}",
                    avail[i], alloc[i], resvd[i], down[i]
                );
            }
        }
        ReplyBody::PreemptJobs(entries) => {
            for (jobid, method) in entries {
                println!("{jobid} {method}");
            }
        }
        ReplyBody::DeleteList(entries) => {
            for (jobid, code) in entries {
                println!("{jobid} {code}");
            }
        }
    }
    std::process::exit(0);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json = cli.json;
    let config = Config::load().unwrap_or_else(|_| Config::from_lookup(|_| None));
    let server = cli.server.unwrap_or_else(|| config.server_name.clone());
    let port = cli.port.unwrap_or(config.batch_service_port);
    let mut client = Client::connect(&server, port, &cli.user).await?;

    let reply = match cli.command {
        Command::Submit {
            queue,
            attrs,
            resources,
            script,
        } => {
            let mut wire_attrs = attrs
                .iter()
                .map(|a| parse_attr(a))
                .collect::<Result<Vec<_>>>()?;
            wire_attrs.extend(resource_attrs(&resources)?);
            let req = client.request(
                ReqType::QueueJob,
                ReqBody::QueueJob {
                    jobid: String::new(),
                    dest: queue,
                    attrs: wire_attrs,
                },
            );
            let reply = client.round_trip(req).await?;
            if reply.is_err() {
                finish(reply, json);
            }
            let ReplyBody::JobId(jobid) = reply.body.clone() else {
                finish(reply, json);
            };
            let data = if script == "-" {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                tokio::io::stdin().read_to_end(&mut buf).await?;
                buf
            } else {
                tokio::fs::read(&script)
                    .await
                    .with_context(|| format!("reading {script}"))?
            };
            for chunk in data.chunks(batch_core::domains::job::SCRIPT_CHUNK) {
                let req = client.request(
                    ReqType::JobScript,
                    ReqBody::JobScript {
                        jobid: jobid.clone(),
                        chunk: chunk.to_vec(),
                    },
                );
                let reply = client.round_trip(req).await?;
                if reply.is_err() {
                    finish(reply, json);
                }
            }
            let req = client.request(ReqType::Commit, ReqBody::Commit { jobid });
            client.round_trip(req).await?
        }
        Command::Delete { jobid } => {
            let req = client.request(ReqType::DeleteJob, ReqBody::DeleteJob { jobid });
            client.round_trip(req).await?
        }
        Command::DeleteList {
            jobids,
            resume_from,
        } => {
            let req = client.request(
                ReqType::DeleteJobList,
                ReqBody::DeleteJobList {
                    jobids,
                    resume_from,
                },
            );
            client.round_trip(req).await?
        }
        Command::Hold { jobid, holds } => {
            let req = client.request(ReqType::HoldJob, ReqBody::HoldJob { jobid, holds });
            client.round_trip(req).await?
        }
        Command::Release { jobid, holds } => {
            let req = client.request(ReqType::ReleaseJob, ReqBody::ReleaseJob { jobid, holds });
            client.round_trip(req).await?
        }
        Command::Modify { jobid, attrs } => {
            let attrs = attrs
                .iter()
                .map(|a| parse_attr(a))
                .collect::<Result<Vec<_>>>()?;
            let req = client.request(ReqType::ModifyJob, ReqBody::ModifyJob { jobid, attrs });
            client.round_trip(req).await?
        }
        Command::Move {
            jobid,
            destination,
        } => {
            let req = client.request(
                ReqType::MoveJob,
                ReqBody::MoveJob {
                    jobid,
                    destination,
                },
            );
            client.round_trip(req).await?
        }
        Command::Order { job1, job2 } => {
            let req = client.request(ReqType::OrderJob, ReqBody::OrderJob { job1, job2 });
            client.round_trip(req).await?
        }
        Command::Run { jobid, exec_vnode } => {
            let req = client.request(ReqType::RunJob, ReqBody::RunJob { jobid, exec_vnode });
            client.round_trip(req).await?
        }
        Command::Asyrun { jobid, exec_vnode } => {
            let req = client.request(
                ReqType::AsyrunJob,
                ReqBody::AsyrunJob { jobid, exec_vnode },
            );
            client.round_trip(req).await?
        }
        Command::Signal { jobid, signame } => {
            let req = client.request(ReqType::SignalJob, ReqBody::SignalJob { jobid, signame });
            client.round_trip(req).await?
        }
        Command::Msg { jobid, text, file } => {
            let req = client.request(
                ReqType::MessageJob,
                ReqBody::MessageJob { jobid, file, text },
            );
            client.round_trip(req).await?
        }
        Command::Rerun { jobid } => {
            let req = client.request(ReqType::Rerun, ReqBody::Rerun { jobid });
            client.round_trip(req).await?
        }
        Command::Locate { jobid } => {
            let req = client.request(ReqType::LocateJob, ReqBody::LocateJob { jobid });
            client.round_trip(req).await?
        }
        Command::StatJob { jobid } => {
            let req = client.request(
                ReqType::StatusJob,
                ReqBody::Status(StatusBody {
                    id: jobid,
                    attrs: Vec::new(),
                }),
            );
            client.round_trip(req).await?
        }
        Command::StatQue { queue } => {
            let req = client.request(
                ReqType::StatusQue,
                ReqBody::Status(StatusBody {
                    id: queue,
                    attrs: Vec::new(),
                }),
            );
            client.round_trip(req).await?
        }
        Command::StatSvr => {
            let req = client.request(ReqType::StatusSvr, ReqBody::Status(StatusBody::default()));
            client.round_trip(req).await?
        }
        Command::StatSched => {
            let req = client.request(
                ReqType::StatusSched,
                ReqBody::Status(StatusBody::default()),
            );
            client.round_trip(req).await?
        }
        Command::StatNode { node } => {
            let req = client.request(
                ReqType::StatusNode,
                ReqBody::Status(StatusBody {
                    id: node,
                    attrs: Vec::new(),
                }),
            );
            client.round_trip(req).await?
        }
        Command::StatResv { resvid } => {
            let req = client.request(
                ReqType::StatusResv,
                ReqBody::Status(StatusBody {
                    id: resvid,
                    attrs: Vec::new(),
                }),
            );
            client.round_trip(req).await?
        }
        Command::Select { attrs } => {
            let attrs = attrs
                .iter()
                .map(|a| {
                    let mut attr = parse_attr(a)?;
                    attr.op = SetOp::Eq;
                    Ok(attr)
                })
                .collect::<Result<Vec<_>>>()?;
            let req = client.request(ReqType::SelectJobs, ReqBody::SelectJobs { attrs });
            client.round_trip(req).await?
        }
        Command::Manager {
            cmd,
            obj,
            name,
            attrs,
        } => {
            let cmd = match cmd.as_str() {
                "create" => 1,
                "delete" => 2,
                "set" => 3,
                "unset" => 4,
                other => {
                    eprintln!("unknown manager command {other}");
                    std::process::exit(2);
                }
            };
            let obj_type = match obj.as_str() {
                "server" => 1,
                "queue" => 2,
                "node" => 3,
                "sched" => 4,
                other => {
                    eprintln!("unknown manager object {other}");
                    std::process::exit(2);
                }
            };
            let attrs = attrs
                .iter()
                .map(|a| parse_attr(a))
                .collect::<Result<Vec<_>>>()?;
            let req = client.request(
                ReqType::Manager,
                ReqBody::Manager {
                    cmd,
                    obj_type,
                    obj_name: name,
                    attrs,
                },
            );
            client.round_trip(req).await?
        }
        Command::Shutdown => {
            let req = client.request(ReqType::Shutdown, ReqBody::Shutdown { manner: 0 });
            client.round_trip(req).await?
        }
        Command::Rescq { resources } => {
            let req = client.request(ReqType::Rescq, ReqBody::Rescq { resources });
            client.round_trip(req).await?
        }
        Command::SubmitResv {
            start,
            end,
            resources,
        } => {
            let mut attrs = vec![
                WireAttr::new("reserve_start", start.to_string()),
                WireAttr::new("reserve_end", end.to_string()),
            ];
            attrs.extend(resource_attrs(&resources)?);
            let req = client.request(
                ReqType::SubmitResv,
                ReqBody::SubmitResv {
                    resvid: String::new(),
                    attrs,
                },
            );
            client.round_trip(req).await?
        }
        Command::ConfirmResv {
            resvid,
            exec_vnode,
            start,
        } => {
            let req = client.request(
                ReqType::ConfirmResv,
                ReqBody::ConfirmResv {
                    resvid,
                    exec_vnode,
                    start,
                },
            );
            client.round_trip(req).await?
        }
        Command::DeleteResv { resvid } => {
            let req = client.request(ReqType::DeleteResv, ReqBody::DeleteResv { resvid });
            client.round_trip(req).await?
        }
    };
    finish(reply, json);
}
