use gatewise::backend::{Backend, Config, Recipient};
use gatewise::bits::BitVec;
use gatewise::bmr::{BmrProvider, BmrWireVec};
use gatewise::channel::SimpleChannel;
use gatewise::Error;

fn bits(s: &str) -> BitVec {
    s.chars().map(|c| c == '1').collect()
}

fn share_input(
    bmr: &BmrProvider,
    owner: usize,
    value: &BitVec,
) -> Result<BmrWireVec, Error> {
    let (setter, wires) = bmr.input(owner, 1, value.len())?;
    if let Some(setter) = setter {
        setter.set(vec![value.clone()])?;
    }
    Ok(wires)
}

/// Runs one party of an N-party circuit over the given inputs (one wire
/// vector per party, owned by that party), revealing `build`'s result to
/// everyone.
async fn party<F>(
    id: usize,
    num_parties: usize,
    channel: SimpleChannel,
    inputs: Vec<BitVec>,
    build: F,
) -> Result<Vec<BitVec>, Error>
where
    F: FnOnce(&BmrProvider, &[BmrWireVec]) -> Result<BmrWireVec, Error>,
{
    let backend = Backend::new(Config::new(id, num_parties), channel)?;
    let bmr = backend.bmr();
    let mut wires = Vec::with_capacity(num_parties);
    for (owner, value) in inputs.iter().enumerate() {
        wires.push(share_input(&bmr, owner, value)?);
    }
    let z = build(&bmr, &wires)?;
    let out = bmr.output(z, Recipient::All)?;
    backend.evaluate().await?;
    let result = out.future()?.recv().await?;
    backend.shutdown().await?;
    Ok(result)
}

async fn eval<F>(inputs: Vec<BitVec>, build: F) -> Result<Vec<BitVec>, Error>
where
    F: Fn(&BmrProvider, &[BmrWireVec]) -> Result<BmrWireVec, Error> + Clone + Send + 'static,
{
    let n = inputs.len();
    let channels = SimpleChannel::channels(n);
    let mut handles = Vec::with_capacity(n);
    for (id, channel) in channels.into_iter().enumerate() {
        handles.push(tokio::spawn(party(
            id,
            n,
            channel,
            inputs.clone(),
            build.clone(),
        )));
    }
    let mut results = Vec::with_capacity(n);
    for (id, handle) in handles.into_iter().enumerate() {
        results.push(handle.await.unwrap_or_else(|_| panic!("party {id} panicked"))?);
    }
    for result in &results {
        assert_eq!(result, &results[0], "parties disagree on the revealed value");
    }
    Ok(results.pop().expect("at least one party"))
}

/// The three-party cascade `AND(AND(x0, x1), x2)` with inputs 1, 0, 1.
#[tokio::test(flavor = "multi_thread")]
async fn three_party_and_cascade() -> Result<(), Error> {
    let result = eval(
        vec![bits("1"), bits("0"), bits("1")],
        |bmr, wires| {
            let t = bmr.and(&wires[0], &wires[1])?;
            bmr.and(&t, &wires[2])
        },
    )
    .await?;
    assert_eq!(result, vec![bits("0")]);
    Ok(())
}

/// One AND gate whose four SIMD lanes cover the whole truth table.
#[tokio::test(flavor = "multi_thread")]
async fn and_truth_table_in_lanes() -> Result<(), Error> {
    let result = eval(vec![bits("0011"), bits("0101")], |bmr, wires| {
        bmr.and(&wires[0], &wires[1])
    })
    .await?;
    assert_eq!(result, vec![bits("0001")]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn xor_is_free_of_interaction_errors() -> Result<(), Error> {
    let result = eval(vec![bits("1010"), bits("1100")], |bmr, wires| {
        bmr.xor(&wires[0], &wires[1])
    })
    .await?;
    assert_eq!(result, vec![bits("0110")]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn double_inversion_is_identity() -> Result<(), Error> {
    let result = eval(vec![bits("10110"), bits("00000")], |bmr, wires| {
        let inverted = bmr.inv(&wires[0])?;
        bmr.inv(&inverted)
    })
    .await?;
    assert_eq!(result, vec![bits("10110")]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn inversion_after_and() -> Result<(), Error> {
    // NAND over all four lane combinations.
    let result = eval(vec![bits("0011"), bits("0101")], |bmr, wires| {
        let t = bmr.and(&wires[0], &wires[1])?;
        bmr.inv(&t)
    })
    .await?;
    assert_eq!(result, vec![bits("1110")]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn three_party_input_to_output_round_trip() -> Result<(), Error> {
    let result = eval(
        vec![bits("110"), bits("011"), bits("101")],
        |_, wires| Ok(wires[1].clone()),
    )
    .await?;
    assert_eq!(result, vec![bits("011")]);
    Ok(())
}

async fn ownership_party(
    id: usize,
    channel: SimpleChannel,
) -> Result<Option<Vec<BitVec>>, Error> {
    let backend = Backend::new(Config::new(id, 3), channel)?;
    let bmr = backend.bmr();
    let x = share_input(&bmr, 0, &bits("1"))?;
    let y = share_input(&bmr, 1, &bits("1"))?;
    let z = bmr.and(&x, &y)?;
    let out = bmr.output(z, Recipient::Party(2))?;
    backend.evaluate().await?;
    let result = match out.future() {
        Ok(future) => Some(future.recv().await?),
        Err(Error::ConfigInvalid(msg)) => {
            assert!(msg.contains("not this party's output"), "unexpected: {msg}");
            None
        }
        Err(e) => return Err(e),
    };
    backend.shutdown().await?;
    Ok(result)
}

#[tokio::test(flavor = "multi_thread")]
async fn output_addressed_to_one_party() -> Result<(), Error> {
    let channels = SimpleChannel::channels(3);
    let mut handles = Vec::new();
    for (id, channel) in channels.into_iter().enumerate() {
        handles.push(tokio::spawn(ownership_party(id, channel)));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("party panicked")?);
    }
    assert_eq!(results[0], None);
    assert_eq!(results[1], None);
    assert_eq!(results[2], Some(vec![bits("1")]));
    Ok(())
}
