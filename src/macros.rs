/// Macro to simplify creating a [`crate::job::JobAction::Func`] action.
///
/// Takes an optional synchronous setup block and a mandatory async logic
/// block, and handles the boxing. The setup block runs on every invocation,
/// which is where captured `Arc`s should be cloned so the closure stays
/// callable across runs. The logic block must evaluate to
/// `Result<(), String>`.
///
/// # Usage
///
/// ```ignore
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use tickwheel::job_fn;
///
/// let counter = Arc::new(AtomicUsize::new(0));
/// let action = job_fn! {
///     // Setup block: clone captures needed inside the async block.
///     {
///         let counter = counter.clone();
///     }
///     {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// };
///
/// // Without setup block:
/// let simple = job_fn! {
///     {
///         tracing::info!("tick");
///         Ok(())
///     }
/// };
/// ```
#[macro_export]
macro_rules! job_fn {
    // Matcher 1: setup block followed by the main logic block.
    (
        { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        $crate::job::JobAction::func(move || {
            $($setup_stmts)*

            let fut = async move { $main_block };

            ::std::boxed::Box::pin(fut)
                as ::std::pin::Pin<::std::boxed::Box<
                    dyn ::std::future::Future<Output = ::std::result::Result<(), ::std::string::String>>
                        + ::std::marker::Send
                        + 'static,
                >>
        })
    };

    // Matcher 2: only the main logic block.
    (
        $main_block:block
    ) => {
        $crate::job::JobAction::func(move || {
            let fut = async move { $main_block };

            ::std::boxed::Box::pin(fut)
                as ::std::pin::Pin<::std::boxed::Box<
                    dyn ::std::future::Future<Output = ::std::result::Result<(), ::std::string::String>>
                        + ::std::marker::Send
                        + 'static,
                >>
        })
    };
}
