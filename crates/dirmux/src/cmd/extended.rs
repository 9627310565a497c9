use dirmux_frame::{ExtendedResponse, Request};

use crate::cmd::{ExtendedArgs, Session};
use crate::exit::{frame_error, result_exit_code, CliError, CliResult};
use crate::output::{print_result, value_preview, OutputFormat, ResultOutput};

pub fn run(args: ExtendedArgs, format: OutputFormat) -> CliResult<i32> {
    let session = Session::open(&args.server)?;

    if args.credentials.dn.is_some() {
        let (_, result) = session.bind(&args.credentials)?;
        if !result.is_success() {
            return Err(CliError::new(
                result_exit_code(result.result_code),
                format!(
                    "bind failed with result {}: {}",
                    result.result_code, result.diagnostic_message
                ),
            ));
        }
    }

    let request = Request::extended(&args.oid, args.value.as_deref().map(str::as_bytes));
    let (id, frame) = session.call("extended operation failed", &request, None)?;
    let response = ExtendedResponse::decode(&frame)
        .map_err(|err| frame_error("extended operation failed", err))?;

    let out = ResultOutput::new(
        "https://schemas.3leaps.dev/dirmux/cli/v1/extended-result.schema.json",
        &session.host,
        session.port,
        "extended",
        id,
        &response.result,
    )
    .detail("request oid", args.oid.as_str())
    .detail(
        "response oid",
        response.oid.clone().unwrap_or_else(|| "-".to_string()),
    )
    .detail(
        "response value",
        response
            .value
            .as_deref()
            .map(value_preview)
            .unwrap_or_else(|| "-".to_string()),
    );
    print_result(&out, format);

    session.connection.disconnect();
    Ok(result_exit_code(response.result.result_code))
}
