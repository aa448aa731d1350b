//! Command-line client for an encrypted evaluation server.
//!
//! Keys are generated and kept locally; only the public part of a context
//! is ever sent. Results come back encrypted and are decrypted here.
//!
//! Usage:
//!   heval create-context ctx.bin
//!   heval -c ctx.bin encrypt input.json input.ct
//!   heval -c ctx.bin eval LinearLayer input.ct output.ct
//!   heval -c ctx.bin decrypt output.ct output.json
//!
//! Plain vectors are JSON arrays of numbers. Failures exit with the code of
//! their error kind (10-18 server side, 20 connection, 21 local decryption).

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use heval_client::ckks::params::{
    DEFAULT_COEFF_MOD_BIT_SIZES, DEFAULT_POLY_MODULUS_DEGREE, DEFAULT_SCALE_BITS,
};
use heval_client::codec::{self, CodecError};
use heval_client::protocol::ErrorKind;
use heval_client::{
    Ciphertext, CkksParams, ClientError, ContextOptions, DecryptionError, EncryptionContext,
    EvalClient,
};

#[derive(Parser)]
#[command(name = "heval", about = "Client for encrypted model evaluation")]
struct Cli {
    /// Server base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:8000")]
    server: String,

    /// Context file
    #[arg(short, long, global = true, env = "HEVAL_CONTEXT")]
    context: Option<PathBuf>,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new key set and write it to a context file
    CreateContext {
        out: PathBuf,
        #[arg(long, default_value_t = DEFAULT_POLY_MODULUS_DEGREE)]
        degree: usize,
        /// Bit sizes of q0..qL followed by the special prime
        #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_COEFF_MOD_BIT_SIZES)]
        coeff_mod_bit_sizes: Vec<u32>,
        #[arg(long, default_value_t = DEFAULT_SCALE_BITS)]
        scale_bits: u32,
        /// Skip relinearization keys (models that multiply ciphertexts will refuse)
        #[arg(long)]
        no_relin: bool,
        /// Skip galois keys (models that rotate slots will refuse)
        #[arg(long)]
        no_galois: bool,
        /// Write a public-only context
        #[arg(long)]
        no_secret_key: bool,
    },
    /// Encrypt a JSON vector
    Encrypt { input: PathBuf, out: PathBuf },
    /// Decrypt a ciphertext to a JSON vector
    Decrypt { input: PathBuf, out: PathBuf },
    /// Evaluate a model on an encrypted input
    Eval {
        model: String,
        input: PathBuf,
        out: PathBuf,
        #[arg(long)]
        version: Option<String>,
        /// Decrypt the result and write JSON instead of a ciphertext
        #[arg(long)]
        decrypt: bool,
    },
    /// List models the server offers
    ListModels {
        #[arg(long)]
        only_names: bool,
    },
    /// Show one model's descriptor
    ModelInfo { name: String },
    /// Check that the server is up
    Ping,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        eprintln!("error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let client = EvalClient::new(&cli.server);
    let context = cli.context;

    match cli.command {
        Command::CreateContext {
            out,
            degree,
            coeff_mod_bit_sizes,
            scale_bits,
            no_relin,
            no_galois,
            no_secret_key,
        } => {
            let params = CkksParams::new(degree, &coeff_mod_bit_sizes, scale_bits)
                .context("invalid encryption parameters")?;
            let ctx = EncryptionContext::generate(
                params,
                ContextOptions {
                    relin_keys: !no_relin,
                    galois_keys: !no_galois,
                    keep_secret: !no_secret_key,
                },
                &mut rand::thread_rng(),
            )
            .context("key generation failed")?;
            let bytes = codec::encode_context(&ctx, true)?;
            write_file(&out, &bytes)?;
            eprintln!(
                "wrote {} ({} bytes, key {})",
                out.display(),
                bytes.len(),
                &hex::encode(ctx.key_id())[..16]
            );
        }
        Command::Encrypt { input, out } => {
            let ctx = load_context(context.as_deref())?;
            let values = read_vector(&input)?;
            let ct = ctx.encrypt(&values).context("encryption failed")?;
            write_file(&out, &codec::encode_ciphertext(&ct)?)?;
        }
        Command::Decrypt { input, out } => {
            let ctx = load_context(context.as_deref())?;
            let ct = read_ciphertext(&input)?;
            write_vector(&out, &ctx.decrypt(&ct)?)?;
        }
        Command::Eval {
            model,
            input,
            out,
            version,
            decrypt,
        } => {
            let ctx = load_context(context.as_deref())?;
            let ct = read_ciphertext(&input)?;
            let result = client.evaluate(&model, version.as_deref(), &ctx, &ct)?;
            if decrypt {
                let values = ctx.decrypt(&result).map_err(ClientError::from)?;
                write_vector(&out, &values)?;
            } else {
                write_file(&out, &codec::encode_ciphertext(&result)?)?;
            }
        }
        Command::ListModels { only_names } => {
            let models = client.list_models()?;
            if only_names {
                for m in &models {
                    println!("{}", m.model_name);
                }
            } else {
                println!("{}", serde_json::to_string_pretty(&models)?);
            }
        }
        Command::ModelInfo { name } => {
            let desc = client.model_info(&name)?;
            println!("{}", serde_json::to_string_pretty(&desc)?);
        }
        Command::Ping => {
            if !client.ping() {
                return Err(ClientError::Connection(format!("{} did not answer", cli.server)).into());
            }
            println!("pong");
        }
    }
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<ClientError>() {
        return e.kind().exit_code();
    }
    if err.downcast_ref::<DecryptionError>().is_some() {
        return ErrorKind::LocalDecryptionError.exit_code();
    }
    match err.downcast_ref::<CodecError>() {
        Some(CodecError::MalformedCiphertext(_)) => ErrorKind::MalformedCiphertext.exit_code(),
        Some(_) => ErrorKind::MalformedContext.exit_code(),
        None => 1,
    }
}

fn load_context(path: Option<&Path>) -> anyhow::Result<EncryptionContext> {
    let path = path.context("no context file given (use --context or HEVAL_CONTEXT)")?;
    let bytes = read_file(path)?;
    Ok(codec::decode_context(&bytes).with_context(|| format!("loading {}", path.display()))?)
}

fn read_ciphertext(path: &Path) -> anyhow::Result<Ciphertext> {
    let bytes = read_file(path)?;
    Ok(codec::decode_ciphertext(&bytes).with_context(|| format!("loading {}", path.display()))?)
}

fn read_vector(path: &Path) -> anyhow::Result<Vec<f64>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))
}

fn write_vector(path: &Path, values: &[f64]) -> anyhow::Result<()> {
    let json = serde_json::to_string(values)?;
    write_file(path, json.as_bytes())
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}
