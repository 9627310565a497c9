use crate::cmd::{BindArgs, Session};
use crate::exit::{result_exit_code, CliResult};
use crate::output::{print_result, OutputFormat, ResultOutput};

pub fn run(args: BindArgs, format: OutputFormat) -> CliResult<i32> {
    let session = Session::open(&args.server)?;
    let (id, result) = session.bind(&args.credentials)?;

    let identity = session
        .connection
        .bound_identity()
        .map(|bound| if bound.anonymous { "anonymous".to_string() } else { bound.dn });
    let out = ResultOutput::new(
        "https://schemas.3leaps.dev/dirmux/cli/v1/bind-result.schema.json",
        &session.host,
        session.port,
        "bind",
        id,
        &result,
    )
    .detail("bound", session.connection.is_bound().to_string())
    .detail("identity", identity.unwrap_or_else(|| "-".to_string()));
    print_result(&out, format);

    session.connection.disconnect();
    Ok(result_exit_code(result.result_code))
}
